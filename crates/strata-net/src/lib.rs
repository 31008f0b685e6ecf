//! TCP networking: length-prefixed framing, payload compression, the typed
//! packet protocol, and the server and client connection loops.

pub mod codec;
pub mod compression;
pub mod framing;
pub mod packets;
pub mod tcp_client;
pub mod tcp_server;

pub use codec::{PROTOCOL_VERSION, Packet, PacketError, ReadPacketError, read_packet, write_packet};
pub use compression::{CompressionConfig, CompressionError, compress_payload, decompress_payload};
pub use framing::{FrameConfig, FrameError, read_frame, write_frame};
pub use packets::{ChunkData, ClientPacket, Pose, ServerPacket, SkinPixels};
pub use tcp_client::{ConnectionState, GameClient};
pub use tcp_server::{
    ConnectionHandle, ConnectionHandler, ConnectionId, ConnectionLimitReached, ConnectionMap,
    GameServer, IdGenerator, ServerConfig,
};
