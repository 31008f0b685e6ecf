//! Typed client and server packets.

use bitvec::prelude::{BitSlice, BitVec, Lsb0};
use strata_voxel::fragment::{FragmentGrid, presence_from_bytes, presence_to_bytes};
use strata_voxel::{ChunkPos, FragmentedChunk, SECTION_HEIGHT};

use crate::codec::{Packet, PacketError, PacketReader, PacketWriter};
use crate::compression::{CompressionConfig, compress_payload, decompress_payload};

/// Longest accepted username in bytes.
pub const MAX_USERNAME_LEN: usize = 32;

/// Largest accepted skin, in pixels.
pub const MAX_SKIN_PIXELS: usize = 128 * 128;

const FLAG_POSITION: u8 = 0b01;
const FLAG_ROTATION: u8 = 0b10;

// ---------------------------------------------------------------------------
// Shared payloads
// ---------------------------------------------------------------------------

/// Player skin as a row-major grid of ARGB pixels.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SkinPixels {
    pub width: u16,
    pub height: u16,
    pub pixels: Vec<u32>,
}

/// Position and rotation, each optional.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Pose {
    pub position: Option<[f64; 3]>,
    /// Yaw and pitch in degrees.
    pub rotation: Option<[f32; 2]>,
}

impl Pose {
    fn encode(&self, w: &mut PacketWriter) {
        let mut flags = 0;
        if self.position.is_some() {
            flags |= FLAG_POSITION;
        }
        if self.rotation.is_some() {
            flags |= FLAG_ROTATION;
        }
        w.put_u8(flags);
        if let Some(p) = self.position {
            p.iter().for_each(|&v| w.put_f64(v));
        }
        if let Some([yaw, pitch]) = self.rotation {
            w.put_f32(yaw);
            w.put_f32(pitch);
        }
    }

    fn decode(r: &mut PacketReader<'_>) -> Result<Self, PacketError> {
        let flags = r.get_flags(FLAG_POSITION | FLAG_ROTATION)?;
        let position = if flags & FLAG_POSITION != 0 {
            Some([r.get_f64()?, r.get_f64()?, r.get_f64()?])
        } else {
            None
        };
        let rotation = if flags & FLAG_ROTATION != 0 {
            Some([r.get_f32()?, r.get_f32()?])
        } else {
            None
        };
        if position.is_some_and(|p| !p.iter().all(|v| v.is_finite())) {
            return Err(non_finite("position"));
        }
        if rotation.is_some_and(|rot| !rot.iter().all(|v| v.is_finite())) {
            return Err(non_finite("rotation"));
        }
        Ok(Self { position, rotation })
    }
}

fn non_finite(field: &'static str) -> PacketError {
    PacketError::Malformed {
        field,
        reason: "not a finite number".to_string(),
    }
}

fn put_origin(w: &mut PacketWriter, origin: ChunkPos) {
    w.put_i32(origin.x());
    w.put_i32(origin.z());
}

fn get_origin(r: &mut PacketReader<'_>) -> Result<ChunkPos, PacketError> {
    let (x, z) = (r.get_i32()?, r.get_i32()?);
    let origin = ChunkPos::containing(x, z);
    if origin.x() != x || origin.z() != z {
        return Err(PacketError::Malformed {
            field: "chunk origin",
            reason: format!("({x}, {z}) is not chunk-aligned"),
        });
    }
    Ok(origin)
}

/// One chunk in wire form: which sections and fragments hold blocks, plus
/// the fragment payload behind a compression flag byte.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkData {
    pub origin: ChunkPos,
    pub height: i32,
    pub section_presence: Vec<u8>,
    pub fragment_presence: Vec<u8>,
    pub payload: Vec<u8>,
}

impl ChunkData {
    pub fn new(
        origin: ChunkPos,
        height: i32,
        sections: &BitSlice<u64, Lsb0>,
        fragments: &FragmentedChunk,
        compression: &CompressionConfig,
    ) -> Self {
        Self {
            origin,
            height,
            section_presence: presence_to_bytes(sections),
            fragment_presence: presence_to_bytes(&fragments.presence),
            payload: compress_payload(&fragments.payload, compression),
        }
    }

    /// One bit per 16-high section, set when the section holds blocks.
    pub fn sections(&self) -> Result<BitVec<u64, Lsb0>, PacketError> {
        let count = usize::try_from(self.height / SECTION_HEIGHT).unwrap_or(0);
        presence_from_bytes(&self.section_presence, count).map_err(|e| PacketError::Malformed {
            field: "section presence",
            reason: e.to_string(),
        })
    }

    /// Decompresses the payload and rebuilds the fragment presence set.
    pub fn fragments(&self) -> Result<FragmentedChunk, PacketError> {
        let grid = FragmentGrid::for_height(self.height);
        let presence =
            presence_from_bytes(&self.fragment_presence, grid.len()).map_err(|e| {
                PacketError::Malformed {
                    field: "fragment presence",
                    reason: e.to_string(),
                }
            })?;
        Ok(FragmentedChunk {
            presence,
            payload: decompress_payload(&self.payload)?,
        })
    }

    fn encode(&self, w: &mut PacketWriter) {
        put_origin(w, self.origin);
        w.put_i32(self.height);
        w.put_bytes(&self.section_presence);
        w.put_bytes(&self.fragment_presence);
        w.put_bytes(&self.payload);
    }

    fn decode(r: &mut PacketReader<'_>) -> Result<Self, PacketError> {
        let origin = get_origin(r)?;
        let height = r.get_i32()?;
        if height <= 0 || height % SECTION_HEIGHT != 0 {
            return Err(PacketError::Malformed {
                field: "world height",
                reason: height.to_string(),
            });
        }
        Ok(Self {
            origin,
            height,
            section_presence: r.get_bytes()?,
            fragment_presence: r.get_bytes()?,
            payload: r.get_bytes()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub enum ClientPacket {
    Handshake { client_version: String },
    UserInfo { username: String, skin: SkinPixels },
    ChunkDataRequest { origin: ChunkPos },
    ChunkLoadConfirm { origin: ChunkPos },
    ChunkUnload { origin: ChunkPos },
    Move(Pose),
    ChunkLoadingDistanceChange { distance: u32 },
}

impl Packet for ClientPacket {
    fn id(&self) -> u8 {
        match self {
            Self::Handshake { .. } => 0x01,
            Self::UserInfo { .. } => 0x02,
            Self::ChunkDataRequest { .. } => 0x03,
            Self::ChunkLoadConfirm { .. } => 0x04,
            Self::ChunkUnload { .. } => 0x05,
            Self::Move(_) => 0x06,
            Self::ChunkLoadingDistanceChange { .. } => 0x07,
        }
    }

    fn encode_body(&self, w: &mut PacketWriter) {
        match self {
            Self::Handshake { client_version } => w.put_str(client_version),
            Self::UserInfo { username, skin } => {
                w.put_str(username);
                w.put_u16(skin.width);
                w.put_u16(skin.height);
                skin.pixels.iter().for_each(|&p| w.put_u32(p));
            }
            Self::ChunkDataRequest { origin }
            | Self::ChunkLoadConfirm { origin }
            | Self::ChunkUnload { origin } => put_origin(w, *origin),
            Self::Move(pose) => pose.encode(w),
            Self::ChunkLoadingDistanceChange { distance } => w.put_u32(*distance),
        }
    }

    fn decode_body(id: u8, r: &mut PacketReader<'_>) -> Result<Self, PacketError> {
        Ok(match id {
            0x01 => Self::Handshake {
                client_version: r.get_str()?,
            },
            0x02 => {
                let username = r.get_str()?;
                if username.len() > MAX_USERNAME_LEN {
                    return Err(PacketError::TooLong {
                        field: "username",
                        len: username.len(),
                    });
                }
                let width = r.get_u16()?;
                let height = r.get_u16()?;
                let count = usize::from(width) * usize::from(height);
                if count > MAX_SKIN_PIXELS {
                    return Err(PacketError::TooLong {
                        field: "skin",
                        len: count,
                    });
                }
                let pixels = (0..count)
                    .map(|_| r.get_u32())
                    .collect::<Result<Vec<_>, _>>()?;
                Self::UserInfo {
                    username,
                    skin: SkinPixels {
                        width,
                        height,
                        pixels,
                    },
                }
            }
            0x03 => Self::ChunkDataRequest {
                origin: get_origin(r)?,
            },
            0x04 => Self::ChunkLoadConfirm {
                origin: get_origin(r)?,
            },
            0x05 => Self::ChunkUnload {
                origin: get_origin(r)?,
            },
            0x06 => Self::Move(Pose::decode(r)?),
            0x07 => Self::ChunkLoadingDistanceChange {
                distance: r.get_u32()?,
            },
            other => return Err(PacketError::UnknownPacket(other)),
        })
    }
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub enum ServerPacket {
    RequestUserInfo,
    SessionValidationConfirmation { player_id: u64 },
    /// Sent once after the session is confirmed. `send_unix_time_ms` lets
    /// the client estimate clock offset.
    WorldSetup {
        world_height: i32,
        world_time: u64,
        send_unix_time_ms: i64,
    },
    ChunkData(ChunkData),
    ChunkRequestConfirmation { origin: ChunkPos },
    PositionSet(Pose),
    ForceChunkLoadingDistanceChange { distance: u32 },
    RequestRenderDistance,
    DisconnectMessage { reason: String },
}

impl Packet for ServerPacket {
    fn id(&self) -> u8 {
        match self {
            Self::RequestUserInfo => 0x01,
            Self::SessionValidationConfirmation { .. } => 0x02,
            Self::WorldSetup { .. } => 0x03,
            Self::ChunkData(_) => 0x04,
            Self::ChunkRequestConfirmation { .. } => 0x05,
            Self::PositionSet(_) => 0x06,
            Self::ForceChunkLoadingDistanceChange { .. } => 0x07,
            Self::RequestRenderDistance => 0x08,
            Self::DisconnectMessage { .. } => 0x09,
        }
    }

    fn encode_body(&self, w: &mut PacketWriter) {
        match self {
            Self::RequestUserInfo | Self::RequestRenderDistance => {}
            Self::SessionValidationConfirmation { player_id } => w.put_u64(*player_id),
            Self::WorldSetup {
                world_height,
                world_time,
                send_unix_time_ms,
            } => {
                w.put_i32(*world_height);
                w.put_u64(*world_time);
                w.put_i64(*send_unix_time_ms);
            }
            Self::ChunkData(data) => data.encode(w),
            Self::ChunkRequestConfirmation { origin } => put_origin(w, *origin),
            Self::PositionSet(pose) => pose.encode(w),
            Self::ForceChunkLoadingDistanceChange { distance } => w.put_u32(*distance),
            Self::DisconnectMessage { reason } => w.put_str(reason),
        }
    }

    fn decode_body(id: u8, r: &mut PacketReader<'_>) -> Result<Self, PacketError> {
        Ok(match id {
            0x01 => Self::RequestUserInfo,
            0x02 => Self::SessionValidationConfirmation {
                player_id: r.get_u64()?,
            },
            0x03 => Self::WorldSetup {
                world_height: r.get_i32()?,
                world_time: r.get_u64()?,
                send_unix_time_ms: r.get_i64()?,
            },
            0x04 => Self::ChunkData(ChunkData::decode(r)?),
            0x05 => Self::ChunkRequestConfirmation {
                origin: get_origin(r)?,
            },
            0x06 => Self::PositionSet(Pose::decode(r)?),
            0x07 => Self::ForceChunkLoadingDistanceChange {
                distance: r.get_u32()?,
            },
            0x08 => Self::RequestRenderDistance,
            0x09 => Self::DisconnectMessage {
                reason: r.get_str()?,
            },
            other => return Err(PacketError::UnknownPacket(other)),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
