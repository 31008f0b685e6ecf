//! Vertical block columns: [`Chunk`], its 16-high [`ChunkSection`] views and
//! the coordinates that address them.
//!
//! A chunk covers a `CHUNK_SIZE x CHUNK_SIZE` footprint for the full world
//! height. Cells are `Option<BlockState>`, `None` being air.

use std::sync::Arc;

use bitvec::prelude::*;
use thiserror::Error;

use crate::block::{BlockPos, BlockState};
use crate::changer::{BlockChange, BlockChangeSender};
use crate::entity::{Entity, TrackedEntity};
use crate::palette::IndexedBlockStatePalette;
use crate::storage::{BlockStateStorage, StorageError};

/// Footprint edge length of a chunk in blocks.
pub const CHUNK_SIZE: i32 = 16;

/// Largest horizontal block coordinate, in either direction, a viewer can
/// stand at. Keeps every chunk within loading range of a viewer addressable
/// in `i32`.
pub const WORLD_BORDER: i32 = 30_000_000;

/// Whether `(x, z)` is a finite position inside [`WORLD_BORDER`].
pub fn within_world_border(x: f64, z: f64) -> bool {
    let border = f64::from(WORLD_BORDER);
    x.is_finite() && z.is_finite() && x.abs() <= border && z.abs() <= border
}

/// Height of one section in blocks.
pub const SECTION_HEIGHT: i32 = 16;

/// Cells in one 16x16x16 section.
pub const SECTION_VOLUME: usize = (CHUNK_SIZE * CHUNK_SIZE * SECTION_HEIGHT) as usize;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("block ({x}, {z}) lies outside chunk at {origin:?}")]
    OutsideFootprint { x: i32, z: i32, origin: ChunkPos },
    #[error("y {y} outside world height {height}")]
    OutsideHeight { y: i32, height: i32 },
    #[error("chunk {0:?} is loaded; untracked writes are only allowed before loading")]
    AlreadyLoaded(ChunkPos),
    #[error("world height {0} is not a positive multiple of {SECTION_HEIGHT}")]
    InvalidHeight(i32),
    #[error("no chunk at {0:?}")]
    UnknownChunk(ChunkPos),
    #[error("chunk {0:?} already exists")]
    DuplicateChunk(ChunkPos),
    #[error("block change queue is closed")]
    ChangerClosed,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Checks that `height` can be split into whole sections.
pub fn validate_height(height: i32) -> Result<(), ChunkError> {
    if height <= 0 || height % SECTION_HEIGHT != 0 {
        return Err(ChunkError::InvalidHeight(height));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Coordinates
// ---------------------------------------------------------------------------

/// Block-space origin of a chunk. Always aligned to [`CHUNK_SIZE`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkPos {
    x: i32,
    z: i32,
}

impl ChunkPos {
    /// The chunk whose footprint contains block column `(x, z)`.
    pub const fn containing(x: i32, z: i32) -> Self {
        Self {
            x: x.div_euclid(CHUNK_SIZE) * CHUNK_SIZE,
            z: z.div_euclid(CHUNK_SIZE) * CHUNK_SIZE,
        }
    }

    /// The chunk at chunk-grid coordinates `(cx, cz)`.
    pub const fn from_chunk_coords(cx: i32, cz: i32) -> Self {
        Self {
            x: cx * CHUNK_SIZE,
            z: cz * CHUNK_SIZE,
        }
    }

    /// Origin x in blocks.
    pub const fn x(self) -> i32 {
        self.x
    }

    /// Origin z in blocks.
    pub const fn z(self) -> i32 {
        self.z
    }

    pub const fn chunk_x(self) -> i32 {
        self.x.div_euclid(CHUNK_SIZE)
    }

    pub const fn chunk_z(self) -> i32 {
        self.z.div_euclid(CHUNK_SIZE)
    }

    /// The chunk `dx` chunks east and `dz` chunks south.
    pub const fn offset(self, dx: i32, dz: i32) -> Self {
        Self {
            x: self.x + dx * CHUNK_SIZE,
            z: self.z + dz * CHUNK_SIZE,
        }
    }

    /// Like [`offset`](Self::offset), but `None` when the result does not
    /// fit in block coordinates.
    pub const fn checked_offset(self, dx: i32, dz: i32) -> Option<Self> {
        let (Some(bx), Some(bz)) = (dx.checked_mul(CHUNK_SIZE), dz.checked_mul(CHUNK_SIZE)) else {
            return None;
        };
        match (self.x.checked_add(bx), self.z.checked_add(bz)) {
            (Some(x), Some(z)) => Some(Self { x, z }),
            _ => None,
        }
    }

    pub const fn neighbor(self, dir: Direction) -> Self {
        let (dx, dz) = dir.offset();
        self.offset(dx, dz)
    }

    /// Whether block column `(x, z)` is inside this chunk's footprint.
    pub const fn contains(self, x: i32, z: i32) -> bool {
        x >= self.x && x < self.x + CHUNK_SIZE && z >= self.z && z < self.z + CHUNK_SIZE
    }

    /// Squared distance in chunk units.
    pub fn distance_sq(self, other: ChunkPos) -> i64 {
        let dx = i64::from(self.chunk_x() - other.chunk_x());
        let dz = i64::from(self.chunk_z() - other.chunk_z());
        dx * dx + dz * dz
    }
}

/// Horizontal neighbour directions. North is -z, west is -x.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    North,
    South,
    West,
    East,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::North,
        Direction::South,
        Direction::West,
        Direction::East,
    ];

    /// `(dx, dz)` in chunks.
    pub const fn offset(self) -> (i32, i32) {
        match self {
            Direction::North => (0, -1),
            Direction::South => (0, 1),
            Direction::West => (-1, 0),
            Direction::East => (1, 0),
        }
    }

    pub const fn opposite(self) -> Direction {
        match self {
            Direction::North => Direction::South,
            Direction::South => Direction::North,
            Direction::West => Direction::East,
            Direction::East => Direction::West,
        }
    }

    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Identifies one section: a chunk plus the section index counted from y = 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionKey {
    pub chunk: ChunkPos,
    pub section: usize,
}

impl SectionKey {
    pub const fn new(chunk: ChunkPos, section: usize) -> Self {
        Self { chunk, section }
    }

    /// Lowest world y covered by the section.
    pub const fn min_y(self) -> i32 {
        self.section as i32 * SECTION_HEIGHT
    }
}

/// Cell index inside a column of `height`; z varies fastest, then y, then x.
#[inline]
pub(crate) fn column_index(height: i32, lx: i32, y: i32, lz: i32) -> usize {
    ((lx * height + y) * CHUNK_SIZE + lz) as usize
}

fn column_volume(height: i32) -> usize {
    (CHUNK_SIZE * CHUNK_SIZE * height) as usize
}

// ---------------------------------------------------------------------------
// Generated block data
// ---------------------------------------------------------------------------

/// Raw cells for one chunk, produced by a generator or received over the
/// network, before a [`Chunk`] owns them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkBlocks {
    origin: ChunkPos,
    height: i32,
    blocks: Vec<Option<BlockState>>,
}

impl ChunkBlocks {
    /// All-air column.
    pub fn new(origin: ChunkPos, height: i32) -> Result<Self, ChunkError> {
        validate_height(height)?;
        Ok(Self {
            origin,
            height,
            blocks: vec![None; column_volume(height)],
        })
    }

    pub fn origin(&self) -> ChunkPos {
        self.origin
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    /// Cell at chunk-local `(lx, y, lz)`; air when out of range.
    pub fn get(&self, lx: i32, y: i32, lz: i32) -> Option<BlockState> {
        if !local_in_range(self.height, lx, y, lz) {
            return None;
        }
        self.blocks[column_index(self.height, lx, y, lz)]
    }

    /// Writes chunk-local `(lx, y, lz)`. Returns `false` when out of range.
    pub fn set(&mut self, lx: i32, y: i32, lz: i32, state: Option<BlockState>) -> bool {
        if !local_in_range(self.height, lx, y, lz) {
            return false;
        }
        self.blocks[column_index(self.height, lx, y, lz)] = state;
        true
    }

    /// Fills the horizontal layer at `y`.
    pub fn fill_layer(&mut self, y: i32, state: Option<BlockState>) {
        for lx in 0..CHUNK_SIZE {
            for lz in 0..CHUNK_SIZE {
                self.set(lx, y, lz, state);
            }
        }
    }

    pub fn blocks(&self) -> &[Option<BlockState>] {
        &self.blocks
    }
}

fn local_in_range(height: i32, lx: i32, y: i32, lz: i32) -> bool {
    (0..CHUNK_SIZE).contains(&lx) && (0..height).contains(&y) && (0..CHUNK_SIZE).contains(&lz)
}

// ---------------------------------------------------------------------------
// Chunk
// ---------------------------------------------------------------------------

/// A full-height column of blocks and the entities standing in it.
///
/// Once loaded, blocks only change through [`set_block`](Chunk::set_block),
/// which queues the edit for the world's block changer. The changer applies
/// it on the world thread at the next tick.
pub struct Chunk {
    origin: ChunkPos,
    height: i32,
    blocks: Vec<Option<BlockState>>,
    entities: Vec<TrackedEntity>,
    loaded: bool,
    /// Loaded neighbours, indexed by [`Direction::index`].
    neighbors: [Option<ChunkPos>; 4],
    changes: Vec<BlockChange>,
    changer: BlockChangeSender,
}

impl Chunk {
    /// An unloaded all-air chunk.
    pub fn new(origin: ChunkPos, height: i32, changer: BlockChangeSender) -> Result<Self, ChunkError> {
        Self::from_blocks(ChunkBlocks::new(origin, height)?, changer)
    }

    /// An unloaded chunk taking ownership of generated cells.
    pub fn from_blocks(blocks: ChunkBlocks, changer: BlockChangeSender) -> Result<Self, ChunkError> {
        validate_height(blocks.height)?;
        Ok(Self {
            origin: blocks.origin,
            height: blocks.height,
            blocks: blocks.blocks,
            entities: Vec::new(),
            loaded: false,
            neighbors: [None; 4],
            changes: Vec::new(),
            changer,
        })
    }

    pub fn origin(&self) -> ChunkPos {
        self.origin
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn section_count(&self) -> usize {
        (self.height / SECTION_HEIGHT) as usize
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub(crate) fn set_loaded(&mut self, loaded: bool) {
        self.loaded = loaded;
    }

    /// Whether world column `(x, z)` lies in this chunk.
    pub fn contains(&self, x: i32, z: i32) -> bool {
        self.origin.contains(x, z)
    }

    /// State at world position `(x, y, z)`.
    ///
    /// `y` outside `0..height` reads as air; `x`/`z` outside the footprint is
    /// an error.
    pub fn get_block_state(&self, x: i32, y: i32, z: i32) -> Result<Option<BlockState>, ChunkError> {
        self.check_footprint(x, z)?;
        if !(0..self.height).contains(&y) {
            return Ok(None);
        }
        Ok(self.local(x - self.origin.x, y, z - self.origin.z))
    }

    /// Queues a change of world position `(x, y, z)` to `state`.
    ///
    /// The chunk itself is untouched until the block changer drains its
    /// queue on the world thread.
    pub fn set_block(&self, x: i32, y: i32, z: i32, state: Option<BlockState>) -> Result<(), ChunkError> {
        self.check_footprint(x, z)?;
        self.check_height(y)?;
        self.changer.submit(self.origin, BlockPos::new(x, y, z), state)
    }

    /// Writes directly, bypassing the change queue and listeners.
    /// Only valid while the chunk is still being generated.
    pub fn set_block_untracked(
        &mut self,
        x: i32,
        y: i32,
        z: i32,
        state: Option<BlockState>,
    ) -> Result<(), ChunkError> {
        if self.loaded {
            return Err(ChunkError::AlreadyLoaded(self.origin));
        }
        self.check_footprint(x, z)?;
        self.check_height(y)?;
        let index = column_index(self.height, x - self.origin.x, y, z - self.origin.z);
        self.blocks[index] = state;
        Ok(())
    }

    /// Writes a queued change and logs it. Returns `None` when the cell
    /// already held `state`.
    pub(crate) fn apply_change(
        &mut self,
        pos: BlockPos,
        state: Option<BlockState>,
    ) -> Result<Option<BlockChange>, ChunkError> {
        self.check_footprint(pos.x, pos.z)?;
        self.check_height(pos.y)?;
        let index = column_index(self.height, pos.x - self.origin.x, pos.y, pos.z - self.origin.z);
        let previous = std::mem::replace(&mut self.blocks[index], state);
        if previous == state {
            return Ok(None);
        }
        let change = BlockChange {
            pos,
            previous,
            current: state,
        };
        self.changes.push(change);
        Ok(Some(change))
    }

    /// Changes applied since the last [`take_block_changes`](Self::take_block_changes).
    pub fn block_changes(&self) -> &[BlockChange] {
        &self.changes
    }

    pub fn take_block_changes(&mut self) -> Vec<BlockChange> {
        std::mem::take(&mut self.changes)
    }

    /// Chunk-local read; air when out of range.
    pub fn local(&self, lx: i32, y: i32, lz: i32) -> Option<BlockState> {
        if !local_in_range(self.height, lx, y, lz) {
            return None;
        }
        self.blocks[column_index(self.height, lx, y, lz)]
    }

    /// All cells in storage order.
    pub fn blocks(&self) -> &[Option<BlockState>] {
        &self.blocks
    }

    /// Copies the cells out for work off the world thread.
    pub fn to_blocks(&self) -> ChunkBlocks {
        ChunkBlocks {
            origin: self.origin,
            height: self.height,
            blocks: self.blocks.clone(),
        }
    }

    pub fn section(&self, index: usize) -> Option<ChunkSection<'_>> {
        (index < self.section_count()).then_some(ChunkSection { chunk: self, index })
    }

    pub fn sections(&self) -> impl Iterator<Item = ChunkSection<'_>> {
        (0..self.section_count()).map(move |index| ChunkSection { chunk: self, index })
    }

    /// One bit per section, set when the section holds any non-air block.
    pub fn section_presence(&self) -> BitVec<u64, Lsb0> {
        self.sections().map(|s| !s.is_empty()).collect()
    }

    // --- neighbours ---

    pub fn neighbor(&self, dir: Direction) -> Option<ChunkPos> {
        self.neighbors[dir.index()]
    }

    pub(crate) fn set_neighbor(&mut self, dir: Direction, pos: Option<ChunkPos>) {
        self.neighbors[dir.index()] = pos;
    }

    // --- entities ---

    pub fn add_entity(&mut self, entity: Box<dyn Entity>) {
        self.entities.push(TrackedEntity::new(entity));
    }

    pub(crate) fn push_tracked(&mut self, entity: TrackedEntity) {
        self.entities.push(entity);
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn entities(&self) -> impl Iterator<Item = &dyn Entity> {
        self.entities.iter().map(TrackedEntity::entity)
    }

    /// `false` if any contained entity vetoes unloading.
    pub fn check_for_unload(&self) -> bool {
        self.entities.iter().all(|e| e.entity().allow_chunk_unload())
    }

    /// Ticks every entity once for `tick_id`, drops the dead, and returns
    /// the entities that moved out of the footprint with their new chunk.
    pub(crate) fn tick_entities(&mut self, tick_id: u64) -> Vec<(ChunkPos, TrackedEntity)> {
        let mut leaving = Vec::new();
        let mut staying = Vec::with_capacity(self.entities.len());
        for mut tracked in std::mem::take(&mut self.entities) {
            tracked.tick_once(tick_id);
            if tracked.entity().is_dead() {
                tracked.entity_mut().on_death();
                continue;
            }
            let [x, _, z] = tracked.entity().position();
            let dest = ChunkPos::containing(x.floor() as i32, z.floor() as i32);
            if dest == self.origin {
                staying.push(tracked);
            } else {
                leaving.push((dest, tracked));
            }
        }
        self.entities = staying;
        leaving
    }

    fn check_footprint(&self, x: i32, z: i32) -> Result<(), ChunkError> {
        if !self.origin.contains(x, z) {
            return Err(ChunkError::OutsideFootprint {
                x,
                z,
                origin: self.origin,
            });
        }
        Ok(())
    }

    fn check_height(&self, y: i32) -> Result<(), ChunkError> {
        if !(0..self.height).contains(&y) {
            return Err(ChunkError::OutsideHeight {
                y,
                height: self.height,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("origin", &self.origin)
            .field("height", &self.height)
            .field("loaded", &self.loaded)
            .field("entities", &self.entities.len())
            .field("neighbors", &self.neighbors)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Read-only view of one 16x16x16 slice of a [`Chunk`].
#[derive(Clone, Copy)]
pub struct ChunkSection<'a> {
    chunk: &'a Chunk,
    index: usize,
}

impl<'a> ChunkSection<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn key(&self) -> SectionKey {
        SectionKey::new(self.chunk.origin, self.index)
    }

    /// World y of the section's bottom layer.
    pub fn min_y(&self) -> i32 {
        self.key().min_y()
    }

    /// Section-local read; air when out of `0..16` on any axis.
    pub fn get(&self, x: i32, y: i32, z: i32) -> Option<BlockState> {
        if !(0..SECTION_HEIGHT).contains(&y) {
            return None;
        }
        self.chunk.local(x, self.min_y() + y, z)
    }

    /// `true` if every cell is air.
    pub fn is_empty(&self) -> bool {
        self.cells().all(|(_, state)| state.is_none())
    }

    /// Palette of the states present, air first.
    pub fn observed_palette(&self) -> IndexedBlockStatePalette {
        IndexedBlockStatePalette::with_air(self.cells().map(|(_, state)| state))
    }

    /// Deep copy into a standalone storage with its own palette.
    pub fn to_storage(&self) -> Result<BlockStateStorage, StorageError> {
        let mut storage = BlockStateStorage::cube(
            CHUNK_SIZE as usize,
            Arc::new(self.observed_palette()),
        );
        for ([x, y, z], state) in self.cells() {
            if state.is_some() {
                storage.set(x, y, z, state)?;
            }
        }
        Ok(storage)
    }

    /// Every cell with its section-local coordinates.
    pub fn cells(&self) -> impl Iterator<Item = ([i32; 3], Option<BlockState>)> + 'a {
        let chunk = self.chunk;
        let base = self.min_y();
        (0..CHUNK_SIZE).flat_map(move |x| {
            (0..SECTION_HEIGHT).flat_map(move |y| {
                (0..CHUNK_SIZE).map(move |z| ([x, y, z], chunk.local(x, base + y, z)))
            })
        })
    }
}

impl std::fmt::Debug for ChunkSection<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkSection")
            .field("key", &self.key())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
