use strata_voxel::{SectionKey, StorageError};
use thiserror::Error;

/// Errors from section meshing and the rebuild pipeline.
#[derive(Debug, Error)]
pub enum MeshError {
    /// The task was cancelled by a newer rebuild of the same section. Not a
    /// failure.
    #[error("mesh task cancelled")]
    Cancelled,
    #[error("a mesh task for {0:?} is already in flight")]
    AlreadyInFlight(SectionKey),
    #[error("no such section {0:?}")]
    UnknownSection(SectionKey),
    #[error("render registry: {0}")]
    Registry(String),
    #[error("mesh task panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("mesh rebuilder is shut down")]
    ShutDown,
}

impl MeshError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
