//! Owner of every chunk in a world, keyed by [`ChunkPos`].
//!
//! Chunks are created once and never dropped; loading only toggles whether
//! a chunk takes part in ticking and rendering. Loaded chunks are linked to
//! their loaded horizontal neighbours so walks across the world can follow
//! links instead of hashing every step.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::block::{BlockSource, BlockState};
use crate::chunk::{Chunk, ChunkError, ChunkPos, Direction, validate_height};

/// Result of [`WorldChunkHandler::unload`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnloadOutcome {
    Unloaded,
    /// An entity in the chunk refused.
    Vetoed,
    NotLoaded,
}

/// Entity movement during one [`WorldChunkHandler::tick_entities`] pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct EntityTickReport {
    /// Entities moved to the chunk their position now falls in.
    pub transferred: usize,
    /// Entities whose destination chunk does not exist yet; they stay put.
    pub stranded: usize,
}

/// All chunks of one world.
#[derive(Debug)]
pub struct WorldChunkHandler {
    height: i32,
    chunks: FxHashMap<ChunkPos, Chunk>,
    loaded: FxHashSet<ChunkPos>,
}

impl WorldChunkHandler {
    pub fn new(height: i32) -> Result<Self, ChunkError> {
        validate_height(height)?;
        Ok(Self {
            height,
            chunks: FxHashMap::default(),
            loaded: FxHashSet::default(),
        })
    }

    /// World height in blocks.
    pub fn height(&self) -> i32 {
        self.height
    }

    /// Registers a freshly created, unloaded chunk.
    pub fn insert(&mut self, chunk: Chunk) -> Result<(), ChunkError> {
        if chunk.height() != self.height {
            return Err(ChunkError::InvalidHeight(chunk.height()));
        }
        let pos = chunk.origin();
        if self.chunks.contains_key(&pos) {
            return Err(ChunkError::DuplicateChunk(pos));
        }
        self.chunks.insert(pos, chunk);
        Ok(())
    }

    pub fn get(&self, pos: ChunkPos) -> Option<&Chunk> {
        self.chunks.get(&pos)
    }

    pub fn get_mut(&mut self, pos: ChunkPos) -> Option<&mut Chunk> {
        self.chunks.get_mut(&pos)
    }

    pub fn contains(&self, pos: ChunkPos) -> bool {
        self.chunks.contains_key(&pos)
    }

    /// Number of chunks, loaded or not.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn is_loaded(&self, pos: ChunkPos) -> bool {
        self.loaded.contains(&pos)
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }

    pub fn loaded_positions(&self) -> impl Iterator<Item = ChunkPos> + '_ {
        self.loaded.iter().copied()
    }

    pub fn positions(&self) -> impl Iterator<Item = ChunkPos> + '_ {
        self.chunks.keys().copied()
    }

    /// The chunk containing block column `(x, z)`, found by scanning every
    /// chunk. Prefer [`get`](Self::get) with [`ChunkPos::containing`].
    pub fn chunk_at_block(&self, x: i32, z: i32) -> Option<&Chunk> {
        self.chunks.values().find(|c| c.contains(x, z))
    }

    /// Marks the chunk loaded and links it with loaded neighbours.
    ///
    /// Returns `Ok(false)` if it was already loaded.
    pub fn load(&mut self, pos: ChunkPos) -> Result<bool, ChunkError> {
        if !self.chunks.contains_key(&pos) {
            return Err(ChunkError::UnknownChunk(pos));
        }
        if !self.loaded.insert(pos) {
            return Ok(false);
        }
        for dir in Direction::ALL {
            let other = pos.neighbor(dir);
            if !self.loaded.contains(&other) {
                continue;
            }
            if let Some(neighbor) = self.chunks.get_mut(&other) {
                neighbor.set_neighbor(dir.opposite(), Some(pos));
            }
            if let Some(chunk) = self.chunks.get_mut(&pos) {
                chunk.set_neighbor(dir, Some(other));
            }
        }
        if let Some(chunk) = self.chunks.get_mut(&pos) {
            chunk.set_loaded(true);
        }
        trace!(?pos, "Chunk loaded");
        Ok(true)
    }

    /// Unloads the chunk unless an entity in it objects, clearing its links.
    pub fn unload(&mut self, pos: ChunkPos) -> Result<UnloadOutcome, ChunkError> {
        let chunk = self.chunks.get(&pos).ok_or(ChunkError::UnknownChunk(pos))?;
        if !self.loaded.contains(&pos) {
            return Ok(UnloadOutcome::NotLoaded);
        }
        if !chunk.check_for_unload() {
            debug!(?pos, "Chunk unload vetoed by entity");
            return Ok(UnloadOutcome::Vetoed);
        }
        self.loaded.remove(&pos);
        for dir in Direction::ALL {
            if let Some(neighbor) = self.chunks.get_mut(&pos.neighbor(dir)) {
                neighbor.set_neighbor(dir.opposite(), None);
            }
        }
        if let Some(chunk) = self.chunks.get_mut(&pos) {
            for dir in Direction::ALL {
                chunk.set_neighbor(dir, None);
            }
            chunk.set_loaded(false);
        }
        trace!(?pos, "Chunk unloaded");
        Ok(UnloadOutcome::Unloaded)
    }

    /// Walks neighbour links from `from` to `target`, along z first and
    /// then along x.
    ///
    /// Returns `None` if `from` is absent or a link along the way is missing.
    pub fn traverse_chunks(&self, from: ChunkPos, target: ChunkPos) -> Option<&Chunk> {
        let mut current = self.chunks.get(&from)?;
        while current.origin().z() != target.z() {
            let dir = if target.z() > current.origin().z() {
                Direction::South
            } else {
                Direction::North
            };
            current = self.chunks.get(&current.neighbor(dir)?)?;
        }
        while current.origin().x() != target.x() {
            let dir = if target.x() > current.origin().x() {
                Direction::East
            } else {
                Direction::West
            };
            current = self.chunks.get(&current.neighbor(dir)?)?;
        }
        Some(current)
    }

    /// State at world `(x, y, z)`; air where no chunk exists.
    pub fn block_state(&self, x: i32, y: i32, z: i32) -> Option<BlockState> {
        self.chunks
            .get(&ChunkPos::containing(x, z))
            .and_then(|c| c.get_block_state(x, y, z).ok().flatten())
    }

    /// Ticks entities in every loaded chunk and moves those that crossed a
    /// chunk border.
    ///
    /// An entity whose destination chunk is missing stays in its old chunk
    /// and is retried next tick.
    pub fn tick_entities(&mut self, tick_id: u64) -> EntityTickReport {
        let mut report = EntityTickReport::default();
        let mut order: Vec<ChunkPos> = self.loaded.iter().copied().collect();
        order.sort_unstable();

        for from in order {
            let Some(chunk) = self.chunks.get_mut(&from) else {
                continue;
            };
            for (to, mut tracked) in chunk.tick_entities(tick_id) {
                match self.chunks.get_mut(&to) {
                    Some(dest) => {
                        tracked.entity_mut().on_chunk_changed(from, to);
                        dest.push_tracked(tracked);
                        report.transferred += 1;
                    }
                    None => {
                        trace!(?from, ?to, "Entity destination chunk missing");
                        if let Some(source) = self.chunks.get_mut(&from) {
                            source.push_tracked(tracked);
                        }
                        report.stranded += 1;
                    }
                }
            }
        }
        report
    }
}

impl BlockSource for WorldChunkHandler {
    fn block_state(&self, x: i32, y: i32, z: i32) -> Option<BlockState> {
        WorldChunkHandler::block_state(self, x, y, z)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
