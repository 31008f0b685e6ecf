//! World event listeners.
//!
//! Listeners run on the world thread, in registration order, with read
//! access to the chunk handler as it stands after the event.

use std::sync::Arc;

use crate::changer::BlockChange;
use crate::chunk::{ChunkPos, SectionKey};
use crate::handler::WorldChunkHandler;

/// Observer of chunk lifecycle and block changes.
///
/// Every method has an empty default so implementors pick what they need.
pub trait WorldListener: Send + Sync {
    /// A chunk was created and registered. It is not loaded yet.
    fn chunk_created(&self, _handler: &WorldChunkHandler, _pos: ChunkPos) {}

    fn chunk_loaded(&self, _handler: &WorldChunkHandler, _pos: ChunkPos) {}

    fn chunk_unloaded(&self, _handler: &WorldChunkHandler, _pos: ChunkPos) {}

    /// A block changed. Fires once per applied change.
    fn block_changed(&self, _handler: &WorldChunkHandler, _change: &BlockChange) {}

    /// The section's mesh is stale. Fires at most once per section per tick.
    fn section_needs_rebuild(&self, _handler: &WorldChunkHandler, _key: SectionKey) {}
}

/// Ordered set of listeners.
#[derive(Default, Clone)]
pub struct WorldListeners {
    listeners: Vec<Arc<dyn WorldListener>>,
}

impl WorldListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, listener: Arc<dyn WorldListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn chunk_created(&self, handler: &WorldChunkHandler, pos: ChunkPos) {
        for l in &self.listeners {
            l.chunk_created(handler, pos);
        }
    }

    pub fn chunk_loaded(&self, handler: &WorldChunkHandler, pos: ChunkPos) {
        for l in &self.listeners {
            l.chunk_loaded(handler, pos);
        }
    }

    pub fn chunk_unloaded(&self, handler: &WorldChunkHandler, pos: ChunkPos) {
        for l in &self.listeners {
            l.chunk_unloaded(handler, pos);
        }
    }

    pub fn block_changed(&self, handler: &WorldChunkHandler, change: &BlockChange) {
        for l in &self.listeners {
            l.block_changed(handler, change);
        }
    }

    pub fn section_needs_rebuild(&self, handler: &WorldChunkHandler, key: SectionKey) {
        for l in &self.listeners {
            l.section_needs_rebuild(handler, key);
        }
    }
}

impl std::fmt::Debug for WorldListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldListeners")
            .field("count", &self.listeners.len())
            .finish()
    }
}
