//! Queued block edits applied on the world thread.
//!
//! Any thread may call [`Chunk::set_block`](crate::Chunk::set_block); the
//! edit travels through a channel to the [`WorldBlockChanger`], which drains
//! it once per tick in submission order. Only loaded chunks take edits;
//! edits to unloaded or missing chunks are dropped. Draining collects every
//! section whose mesh the tick's edits invalidated, each section once.

use crossbeam_channel::{Receiver, Sender};
use rustc_hash::FxHashSet;
use tracing::{debug, trace, warn};

use crate::block::{BlockPos, BlockState};
use crate::chunk::{ChunkError, ChunkPos, SectionKey};
use crate::handler::WorldChunkHandler;
use crate::invalidation::SectionInvalidator;

/// One applied edit, as recorded in the chunk's change log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockChange {
    pub pos: BlockPos,
    pub previous: Option<BlockState>,
    pub current: Option<BlockState>,
}

#[derive(Debug)]
struct QueuedChange {
    chunk: ChunkPos,
    pos: BlockPos,
    state: Option<BlockState>,
}

/// Cloneable handle that chunks use to queue edits.
#[derive(Clone, Debug)]
pub struct BlockChangeSender {
    tx: Sender<QueuedChange>,
}

impl BlockChangeSender {
    pub(crate) fn submit(
        &self,
        chunk: ChunkPos,
        pos: BlockPos,
        state: Option<BlockState>,
    ) -> Result<(), ChunkError> {
        self.tx
            .send(QueuedChange { chunk, pos, state })
            .map_err(|_| ChunkError::ChangerClosed)
    }
}

/// What one drain of the queue did.
#[derive(Debug, Default)]
pub struct AppliedChanges {
    /// Edits that altered a cell, in submission order.
    pub changes: Vec<BlockChange>,
    /// Loaded sections needing a mesh rebuild, deduplicated, in first-hit order.
    pub rebuilds: Vec<SectionKey>,
}

impl AppliedChanges {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Owns the receiving end of the edit queue.
#[derive(Debug)]
pub struct WorldBlockChanger {
    tx: Sender<QueuedChange>,
    rx: Receiver<QueuedChange>,
}

impl WorldBlockChanger {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    pub fn sender(&self) -> BlockChangeSender {
        BlockChangeSender {
            tx: self.tx.clone(),
        }
    }

    /// Edits waiting for the next drain.
    pub fn pending_count(&self) -> usize {
        self.rx.len()
    }

    /// Applies every edit queued before the call, in submission order.
    ///
    /// Edits queued while draining wait for the next call. Edits whose chunk
    /// no longer exists or whose position is invalid are logged and skipped.
    pub fn apply_pending(&self, handler: &mut WorldChunkHandler) -> AppliedChanges {
        let mut applied = AppliedChanges::default();
        let mut seen: FxHashSet<SectionKey> = FxHashSet::default();
        let batch = self.rx.len();
        let height = handler.height();

        for queued in self.rx.try_iter().take(batch) {
            if !handler.is_loaded(queued.chunk) {
                debug!(chunk = ?queued.chunk, pos = ?queued.pos, "Dropping block change for unloaded chunk");
                continue;
            }
            let Some(chunk) = handler.get_mut(queued.chunk) else {
                continue;
            };
            let change = match chunk.apply_change(queued.pos, queued.state) {
                Ok(Some(change)) => change,
                Ok(None) => continue,
                Err(e) => {
                    warn!(pos = ?queued.pos, "Rejected block change: {e}");
                    continue;
                }
            };
            trace!(pos = ?change.pos, previous = ?change.previous, current = ?change.current, "Block changed");
            applied.changes.push(change);

            for key in SectionInvalidator::invalidate(queued.pos, height) {
                if handler.is_loaded(key.chunk) && seen.insert(key) {
                    applied.rebuilds.push(key);
                }
            }
        }
        applied
    }
}

impl Default for WorldBlockChanger {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
