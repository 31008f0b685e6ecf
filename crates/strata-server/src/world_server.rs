//! Connection handler that logs players in and serves chunks from the shared world.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use rustc_hash::FxHashSet;
use strata_net::{
    ChunkData, ClientPacket, CompressionConfig, ConnectionHandle, ConnectionHandler, ConnectionId,
    Packet, Pose, ServerPacket, SkinPixels,
};
use strata_voxel::{
    Chunk, ChunkCreationListener, ChunkFragmenter, ChunkPos, FragmentError, ViewerId, World,
    within_world_border,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::session::{Player, Session, SessionStage};

/// Reasons a session is ended by the server. The message is sent to the client.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unexpected packet 0x{id:02X} during {stage:?}")]
    UnexpectedPacket { id: u8, stage: SessionStage },
    #[error("invalid username {0:?}")]
    InvalidUsername(String),
    #[error("position {0:?} is outside the world")]
    OutsideWorld([f64; 3]),
    #[error("world unavailable")]
    WorldUnavailable,
}

// ---------------------------------------------------------------------------
// Chunk delivery
// ---------------------------------------------------------------------------

/// Encodes chunks for the wire and remembers who asked for chunks that do
/// not exist yet.
///
/// Registered as a creation listener, so requests parked here are answered
/// on the world thread as soon as the chunk is created. If creation fails
/// the waiting connections are disconnected.
pub struct ChunkDelivery {
    fragmenter: ChunkFragmenter,
    compression: CompressionConfig,
    waiting: DashMap<ChunkPos, Vec<ConnectionHandle>>,
}

impl ChunkDelivery {
    pub fn new(fragmenter: ChunkFragmenter, compression: CompressionConfig) -> Self {
        Self {
            fragmenter,
            compression,
            waiting: DashMap::new(),
        }
    }

    pub fn encode(&self, chunk: &Chunk) -> Result<ChunkData, FragmentError> {
        let fragments = self.fragmenter.fragment_chunk(chunk)?;
        Ok(ChunkData::new(
            chunk.origin(),
            chunk.height(),
            &chunk.section_presence(),
            &fragments,
            &self.compression,
        ))
    }

    /// Sends `chunk` followed by the request confirmation to each of `conns`.
    fn deliver<'a>(&self, chunk: &Chunk, conns: impl IntoIterator<Item = &'a ConnectionHandle>) {
        let origin = chunk.origin();
        let data = match self.encode(chunk) {
            Ok(data) => data,
            Err(e) => {
                error!(?origin, "Could not fragment chunk: {e}");
                return;
            }
        };
        for conn in conns {
            conn.send(ServerPacket::ChunkData(data.clone()));
            conn.send(ServerPacket::ChunkRequestConfirmation { origin });
        }
    }

    fn wait_for(&self, origin: ChunkPos, conn: ConnectionHandle) {
        self.waiting.entry(origin).or_default().push(conn);
    }

    /// Drops every parked request from `id`.
    pub fn forget(&self, id: ConnectionId) {
        self.waiting.retain(|_, conns| {
            conns.retain(|c| c.id() != id);
            !conns.is_empty()
        });
    }

    /// Number of chunks with at least one parked request.
    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }
}

impl ChunkCreationListener for ChunkDelivery {
    fn chunk_created(&self, chunk: &Chunk) {
        if let Some((_, conns)) = self.waiting.remove(&chunk.origin()) {
            debug!(origin = ?chunk.origin(), requesters = conns.len(), "Delivering created chunk");
            self.deliver(chunk, conns.iter().filter(|c| !c.is_closed()));
        }
    }

    fn creation_failed(&self, origin: ChunkPos) {
        if let Some((_, conns)) = self.waiting.remove(&origin) {
            warn!(?origin, requesters = conns.len(), "Requested chunk could not be created");
            for conn in conns.iter().filter(|c| !c.is_closed()) {
                conn.disconnect(format!("chunk {origin:?} could not be created"));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// WorldServer
// ---------------------------------------------------------------------------

/// Handles every connection of the server against one shared [`World`].
///
/// Login is handshake, then user info, after which the server confirms the
/// session, describes the world and places the player. Each player is a
/// chunk-loading viewer for as long as it is connected.
pub struct WorldServer {
    world: Arc<Mutex<World>>,
    delivery: Arc<ChunkDelivery>,
    sessions: DashMap<ConnectionId, Session>,
    next_player_id: AtomicU64,
    spawn: [f64; 3],
}

impl WorldServer {
    pub fn new(world: Arc<Mutex<World>>, delivery: Arc<ChunkDelivery>, spawn: [f64; 3]) -> Self {
        Self {
            world,
            delivery,
            sessions: DashMap::new(),
            next_player_id: AtomicU64::new(1),
            spawn,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn player_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.player.is_some()).count()
    }

    fn lock_world(&self) -> Result<MutexGuard<'_, World>, SessionError> {
        self.world.lock().map_err(|_| {
            error!("World lock poisoned");
            SessionError::WorldUnavailable
        })
    }

    fn handshake(&self, session: &mut Session, client_version: String) {
        debug!(conn = ?session.conn.id(), %client_version, "Handshake");
        session.client_version = Some(client_version);
        session.stage = SessionStage::AwaitingUserInfo;
        session.conn.send(ServerPacket::RequestUserInfo);
    }

    fn login(
        &self,
        session: &mut Session,
        username: String,
        skin: SkinPixels,
    ) -> Result<(), SessionError> {
        let valid = !username.is_empty()
            && username
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(SessionError::InvalidUsername(username));
        }

        let player_id = self.next_player_id.fetch_add(1, Ordering::Relaxed);
        let (world_height, world_time) = {
            let mut world = self.lock_world()?;
            world
                .loader_mut()
                .set_viewer(ViewerId(player_id), self.spawn[0], self.spawn[2]);
            (world.height(), world.world_time())
        };

        let conn = &session.conn;
        conn.send(ServerPacket::SessionValidationConfirmation { player_id });
        conn.send(ServerPacket::WorldSetup {
            world_height,
            world_time,
            send_unix_time_ms: unix_time_ms(),
        });
        let pose = Pose {
            position: Some(self.spawn),
            rotation: Some([0.0, 0.0]),
        };
        conn.send(ServerPacket::PositionSet(pose));
        conn.send(ServerPacket::RequestRenderDistance);

        info!(player_id, %username, peer = %conn.peer(), "Player joined");
        session.player = Some(Player {
            player_id,
            username,
            skin,
            pose,
            loaded_chunks: FxHashSet::default(),
        });
        session.stage = SessionStage::Playing;
        Ok(())
    }

    fn play(&self, session: &mut Session, packet: ClientPacket) -> Result<(), SessionError> {
        let conn = session.conn.clone();
        let Some(player) = session.player.as_mut() else {
            return Err(SessionError::UnexpectedPacket {
                id: packet.id(),
                stage: session.stage,
            });
        };
        match packet {
            ClientPacket::ChunkDataRequest { origin } => {
                let world = self.lock_world()?;
                if let Some(chunk) = world.handler().get(origin) {
                    self.delivery.deliver(chunk, [&conn]);
                } else {
                    self.delivery.wait_for(origin, conn);
                    world.creator().demand(origin);
                }
            }
            ClientPacket::ChunkLoadConfirm { origin } => {
                player.loaded_chunks.insert(origin);
            }
            ClientPacket::ChunkUnload { origin } => {
                player.loaded_chunks.remove(&origin);
            }
            ClientPacket::Move(pose) => {
                if let Some(position @ [x, _, z]) = pose.position {
                    if !within_world_border(x, z) {
                        return Err(SessionError::OutsideWorld(position));
                    }
                    self.lock_world()?.loader_mut().set_viewer(player.viewer(), x, z);
                    player.pose.position = pose.position;
                }
                if pose.rotation.is_some() {
                    player.pose.rotation = pose.rotation;
                }
            }
            ClientPacket::ChunkLoadingDistanceChange { distance } => {
                let effective = self
                    .lock_world()?
                    .loader_mut()
                    .set_viewer_distance(player.viewer(), distance);
                if let Some(effective) = effective
                    && effective != distance
                {
                    conn.send(ServerPacket::ForceChunkLoadingDistanceChange {
                        distance: effective,
                    });
                }
            }
            other @ (ClientPacket::Handshake { .. } | ClientPacket::UserInfo { .. }) => {
                return Err(SessionError::UnexpectedPacket {
                    id: other.id(),
                    stage: SessionStage::Playing,
                });
            }
        }
        Ok(())
    }
}

impl ConnectionHandler for WorldServer {
    fn on_connect(&self, conn: &ConnectionHandle) {
        self.sessions.insert(conn.id(), Session::new(conn.clone()));
    }

    fn on_packet(&self, conn: &ConnectionHandle, packet: ClientPacket) {
        let Some(mut session) = self.sessions.get_mut(&conn.id()) else {
            return;
        };
        let result = match (session.stage, packet) {
            (SessionStage::AwaitingHandshake, ClientPacket::Handshake { client_version }) => {
                self.handshake(&mut session, client_version);
                Ok(())
            }
            (SessionStage::AwaitingUserInfo, ClientPacket::UserInfo { username, skin }) => {
                self.login(&mut session, username, skin)
            }
            (SessionStage::Playing, packet) => self.play(&mut session, packet),
            (stage, packet) => Err(SessionError::UnexpectedPacket {
                id: packet.id(),
                stage,
            }),
        };
        drop(session);
        if let Err(e) = result {
            warn!(conn = ?conn.id(), "Ending session: {e}");
            conn.disconnect(e.to_string());
        }
    }

    fn on_disconnect(&self, id: ConnectionId) {
        self.delivery.forget(id);
        let Some((_, session)) = self.sessions.remove(&id) else {
            return;
        };
        if let Some(player) = session.player {
            if let Ok(mut world) = self.lock_world() {
                world.loader_mut().remove_viewer(player.viewer());
            }
            info!(player_id = player.player_id, username = %player.username, "Player left");
        }
    }
}

fn unix_time_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
