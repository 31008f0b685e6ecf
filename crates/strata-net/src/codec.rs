//! Big-endian packet body encoding and packet I/O over framed streams.
//!
//! Every packet body starts with [`PROTOCOL_VERSION`] and a packet id byte.
//! Strings are a `u16` byte length followed by UTF-8; byte blobs are a `u32`
//! length followed by the bytes. Optional fields are gated by a leading flag
//! byte with one bit per field.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::compression::CompressionError;
use crate::framing::{FrameConfig, FrameError, read_frame, write_frame};

/// Wire-protocol version. First byte of every packet.
pub const PROTOCOL_VERSION: u8 = 1;

/// Errors decoding a packet body.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("packet truncated: needed {needed} bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },
    #[error("{0} unread bytes after packet")]
    TrailingBytes(usize),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown packet id 0x{0:02X}")]
    UnknownPacket(u8),
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("undefined bits set in flag byte 0x{0:02X}")]
    InvalidFlags(u8),
    #[error("{field} too long: {len}")]
    TooLong { field: &'static str, len: usize },
    #[error("malformed {field}: {reason}")]
    Malformed { field: &'static str, reason: String },
    #[error(transparent)]
    Compression(#[from] CompressionError),
}

/// A message type that can be sent over a framed connection.
pub trait Packet: Sized + Send + 'static {
    /// Id byte written after the protocol version.
    fn id(&self) -> u8;

    /// Writes the fields after the id byte.
    fn encode_body(&self, w: &mut PacketWriter);

    /// Reads the fields for packet `id`.
    fn decode_body(id: u8, r: &mut PacketReader<'_>) -> Result<Self, PacketError>;

    fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.put_u8(PROTOCOL_VERSION);
        w.put_u8(self.id());
        self.encode_body(&mut w);
        w.into_bytes()
    }

    fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        let mut r = PacketReader::new(bytes);
        let version = r.get_u8()?;
        if version != PROTOCOL_VERSION {
            return Err(PacketError::UnsupportedVersion(version));
        }
        let id = r.get_u8()?;
        let packet = Self::decode_body(id, &mut r)?;
        r.finish()?;
        Ok(packet)
    }
}

/// Append-only big-endian writer.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buf: Vec<u8>,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// `u32` length, then the bytes.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    /// `u16` length, then UTF-8. Longer strings are cut at a char boundary.
    pub fn put_str(&mut self, s: &str) {
        let mut end = s.len().min(u16::MAX as usize);
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        self.put_u16(end as u16);
        self.buf.extend_from_slice(&s.as_bytes()[..end]);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Big-endian cursor over a received packet.
#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PacketError> {
        if self.remaining() < n {
            return Err(PacketError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], PacketError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8, PacketError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_bool(&mut self) -> Result<bool, PacketError> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(PacketError::Malformed {
                field: "bool",
                reason: format!("byte {other}"),
            }),
        }
    }

    pub fn get_u16(&mut self) -> Result<u16, PacketError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub fn get_u32(&mut self) -> Result<u32, PacketError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub fn get_i32(&mut self) -> Result<i32, PacketError> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    pub fn get_u64(&mut self) -> Result<u64, PacketError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    pub fn get_i64(&mut self) -> Result<i64, PacketError> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    pub fn get_f32(&mut self) -> Result<f32, PacketError> {
        Ok(f32::from_be_bytes(self.array()?))
    }

    pub fn get_f64(&mut self) -> Result<f64, PacketError> {
        Ok(f64::from_be_bytes(self.array()?))
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>, PacketError> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn get_str(&mut self) -> Result<String, PacketError> {
        let len = usize::from(self.get_u16()?);
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| PacketError::InvalidUtf8)
    }

    /// Reads a flag byte, rejecting bits outside `allowed`.
    pub fn get_flags(&mut self, allowed: u8) -> Result<u8, PacketError> {
        let flags = self.get_u8()?;
        if flags & !allowed != 0 {
            return Err(PacketError::InvalidFlags(flags));
        }
        Ok(flags)
    }

    /// Fails if any bytes are left.
    pub fn finish(&self) -> Result<(), PacketError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(PacketError::TrailingBytes(n)),
        }
    }
}

/// Errors receiving a packet from a stream.
#[derive(Debug, thiserror::Error)]
pub enum ReadPacketError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Packet(#[from] PacketError),
}

/// Encodes `packet` and writes it as one frame.
pub async fn write_packet<W: AsyncWriteExt + Unpin, P: Packet>(
    writer: &mut W,
    packet: &P,
    config: &FrameConfig,
) -> Result<(), FrameError> {
    write_frame(writer, &packet.encode(), config).await
}

/// Reads one frame and decodes it.
pub async fn read_packet<R: AsyncReadExt + Unpin, P: Packet>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<P, ReadPacketError> {
    let frame = read_frame(reader, config).await?;
    Ok(P::decode(&frame)?)
}
