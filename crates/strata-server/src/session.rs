//! Per-connection login state.

use rustc_hash::FxHashSet;
use strata_net::{ConnectionHandle, Pose, SkinPixels};
use strata_voxel::{ChunkPos, ViewerId};

/// Where a connection is in the login sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStage {
    AwaitingHandshake,
    AwaitingUserInfo,
    Playing,
}

/// A logged-in player.
#[derive(Debug)]
pub struct Player {
    pub player_id: u64,
    pub username: String,
    pub skin: SkinPixels,
    pub pose: Pose,
    /// Chunks the client confirmed it holds.
    pub loaded_chunks: FxHashSet<ChunkPos>,
}

impl Player {
    pub fn viewer(&self) -> ViewerId {
        ViewerId(self.player_id)
    }
}

#[derive(Debug)]
pub struct Session {
    pub conn: ConnectionHandle,
    pub stage: SessionStage,
    pub client_version: Option<String>,
    pub player: Option<Player>,
}

impl Session {
    pub fn new(conn: ConnectionHandle) -> Self {
        Self {
            conn,
            stage: SessionStage::AwaitingHandshake,
            client_version: None,
            player: None,
        }
    }
}
