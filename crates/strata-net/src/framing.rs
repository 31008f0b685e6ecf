//! Length-prefixed framing for TCP streams.
//!
//! A frame is a big-endian `u32` payload length followed by that many
//! bytes. The length excludes the prefix itself; zero is a valid frame.
//! Frames above [`FrameConfig::max_payload_size`] are refused on both ends
//! so a bad peer cannot make the reader allocate arbitrarily.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Bytes in the length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Largest accepted payload. Default: 4 MiB, enough for a full-height
    /// chunk of worst-case fragments.
    pub max_payload_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds limit of {max}")]
    PayloadTooLarge { size: usize, max: u32 },

    /// The peer closed the stream at or inside a frame.
    #[error("connection closed")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameConfig {
    fn check(&self, size: usize) -> Result<(), FrameError> {
        if size > self.max_payload_size as usize {
            return Err(FrameError::PayloadTooLarge {
                size,
                max: self.max_payload_size,
            });
        }
        Ok(())
    }
}

async fn fill<R: AsyncReadExt + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(FrameError::ConnectionClosed),
        Err(e) => Err(FrameError::Io(e)),
    }
}

/// Reads one frame and returns its payload.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Vec<u8>, FrameError> {
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    fill(reader, &mut prefix).await?;
    let len = u32::from_be_bytes(prefix) as usize;
    config.check(len)?;

    let mut payload = vec![0u8; len];
    fill(reader, &mut payload).await?;
    Ok(payload)
}

/// Writes `payload` as one frame and flushes.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    config.check(payload.len())?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
