//! Chunk loading around viewers, with hysteresis and a per-tick creation budget.
//!
//! Every viewer has a position and a loading distance. Each tick the loader
//! loads existing chunks within that distance, requests creation of missing
//! ones nearest first, and unloads chunks that drifted further away than
//! distance + hysteresis from every viewer.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use crate::chunk::{ChunkPos, WORLD_BORDER};
use crate::creator::ChunkCreator;
use crate::handler::{UnloadOutcome, WorldChunkHandler};

/// Configuration for the chunk loader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkLoadConfig {
    /// Distance, in chunks, used for viewers that did not pick their own.
    pub chunk_loading_distance: u32,
    /// Upper bound on any viewer's distance.
    pub max_chunk_loading_distance: u32,
    /// Extra chunks a loaded chunk may lie beyond the loading distance
    /// before it is unloaded.
    pub unload_hysteresis: u32,
    /// Maximum creation requests issued per tick.
    pub creates_per_tick: u32,
}

impl Default for ChunkLoadConfig {
    fn default() -> Self {
        Self {
            chunk_loading_distance: 8,
            max_chunk_loading_distance: 32,
            unload_hysteresis: 2,
            creates_per_tick: 8,
        }
    }
}

/// Identifies something chunks are loaded around, typically a player.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewerId(pub u64);

#[derive(Clone, Copy, Debug)]
struct Viewer {
    chunk: ChunkPos,
    distance: u32,
}

/// Priority queue for chunks awaiting creation, nearest first.
#[derive(Debug, Default)]
pub struct ChunkLoadQueue {
    /// Min-heap: `(distance_squared, ChunkPos)`.
    queue: BinaryHeap<Reverse<(i64, ChunkPos)>>,
    /// Positions already in the queue (dedup guard).
    pending: FxHashSet<ChunkPos>,
}

impl ChunkLoadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a chunk with its squared distance. Duplicates are ignored.
    pub fn enqueue(&mut self, pos: ChunkPos, dist_sq: i64) {
        if self.pending.insert(pos) {
            self.queue.push(Reverse((dist_sq, pos)));
        }
    }

    /// Dequeues the nearest chunk.
    pub fn dequeue(&mut self) -> Option<(i64, ChunkPos)> {
        while let Some(Reverse((dist_sq, pos))) = self.queue.pop() {
            if self.pending.remove(&pos) {
                return Some((dist_sq, pos));
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.pending.clear();
    }
}

/// What one loader tick did.
#[derive(Debug, Default)]
pub struct ChunkLoadTickResult {
    /// Creation requests accepted by the creator.
    pub requested: Vec<ChunkPos>,
    pub loaded: Vec<ChunkPos>,
    pub unloaded: Vec<ChunkPos>,
    /// Unloads refused by an entity.
    pub vetoed: usize,
}

/// The chunk loading/unloading controller. Call [`ChunkLoader::tick`] once
/// per world tick.
#[derive(Debug)]
pub struct ChunkLoader {
    config: ChunkLoadConfig,
    viewers: FxHashMap<ViewerId, Viewer>,
    load_queue: ChunkLoadQueue,
    /// Chunks within loading distance, with squared distance to the nearest viewer.
    wanted: FxHashMap<ChunkPos, i64>,
    /// Chunks within loading distance + hysteresis.
    retained: FxHashSet<ChunkPos>,
    /// Viewers changed since `wanted` was computed.
    dirty: bool,
}

impl ChunkLoader {
    pub fn new(config: ChunkLoadConfig) -> Self {
        Self {
            config,
            viewers: FxHashMap::default(),
            load_queue: ChunkLoadQueue::new(),
            wanted: FxHashMap::default(),
            retained: FxHashSet::default(),
            dirty: true,
        }
    }

    pub fn config(&self) -> &ChunkLoadConfig {
        &self.config
    }

    pub fn load_queue(&self) -> &ChunkLoadQueue {
        &self.load_queue
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    /// Adds or moves a viewer to world position `(x, z)`, clamped to the
    /// world border. A non-finite position is ignored and returns `false`.
    pub fn set_viewer(&mut self, id: ViewerId, x: f64, z: f64) -> bool {
        if !(x.is_finite() && z.is_finite()) {
            warn!(?id, x, z, "Ignoring non-finite viewer position");
            return false;
        }
        let border = f64::from(WORLD_BORDER);
        let block = |v: f64| v.floor().clamp(-border, border) as i32;
        let chunk = ChunkPos::containing(block(x), block(z));
        let default_distance = self.config.chunk_loading_distance;
        let viewer = self.viewers.entry(id).or_insert_with(|| {
            self.dirty = true;
            Viewer {
                chunk,
                distance: default_distance,
            }
        });
        if viewer.chunk != chunk {
            viewer.chunk = chunk;
            self.dirty = true;
        }
        true
    }

    /// Changes a viewer's loading distance, clamped to the configured
    /// maximum. Returns the distance in effect, or `None` for an unknown viewer.
    pub fn set_viewer_distance(&mut self, id: ViewerId, distance: u32) -> Option<u32> {
        let clamped = distance.min(self.config.max_chunk_loading_distance);
        let viewer = self.viewers.get_mut(&id)?;
        if viewer.distance != clamped {
            viewer.distance = clamped;
            self.dirty = true;
        }
        Some(clamped)
    }

    pub fn viewer_distance(&self, id: ViewerId) -> Option<u32> {
        self.viewers.get(&id).map(|v| v.distance)
    }

    pub fn remove_viewer(&mut self, id: ViewerId) -> bool {
        let removed = self.viewers.remove(&id).is_some();
        self.dirty |= removed;
        removed
    }

    /// Changes the distance new viewers start with.
    pub fn set_default_distance(&mut self, distance: u32) {
        self.config.chunk_loading_distance = distance.min(self.config.max_chunk_loading_distance);
    }

    /// Whether `pos` is inside some viewer's loading distance.
    pub fn is_wanted(&self, pos: ChunkPos) -> bool {
        self.wanted.contains_key(&pos)
    }

    /// Runs one tick: loads wanted chunks that exist, requests up to
    /// `creates_per_tick` missing ones nearest first, and unloads loaded
    /// chunks outside every viewer's retention radius.
    pub fn tick(
        &mut self,
        handler: &mut WorldChunkHandler,
        creator: &ChunkCreator,
    ) -> ChunkLoadTickResult {
        let mut result = ChunkLoadTickResult::default();
        if self.dirty {
            self.recompute();
        }

        // --- Step 1: load existing chunks, queue missing ones ---
        for (&pos, &dist_sq) in &self.wanted {
            if !handler.contains(pos) {
                if !creator.is_pending(pos) {
                    self.load_queue.enqueue(pos, dist_sq);
                }
                continue;
            }
            if !handler.is_loaded(pos) && matches!(handler.load(pos), Ok(true)) {
                result.loaded.push(pos);
            }
        }

        // --- Step 2: issue creation requests within budget ---
        let mut budget = self.config.creates_per_tick;
        while budget > 0 {
            let Some((dist_sq, pos)) = self.load_queue.dequeue() else {
                break;
            };
            if handler.contains(pos) || creator.is_pending(pos) || !self.wanted.contains_key(&pos) {
                continue;
            }
            if !creator.request(pos) {
                // Creator queue is full; try again next tick.
                self.load_queue.enqueue(pos, dist_sq);
                break;
            }
            result.requested.push(pos);
            budget -= 1;
        }

        // --- Step 3: unload chunks outside retention ---
        let candidates: Vec<ChunkPos> = handler
            .loaded_positions()
            .filter(|pos| !self.retained.contains(pos))
            .collect();
        for pos in candidates {
            match handler.unload(pos) {
                Ok(UnloadOutcome::Unloaded) => result.unloaded.push(pos),
                Ok(UnloadOutcome::Vetoed) => result.vetoed += 1,
                Ok(UnloadOutcome::NotLoaded) | Err(_) => {}
            }
        }

        result.loaded.sort_unstable();
        result.unloaded.sort_unstable();
        result
    }

    fn recompute(&mut self) {
        self.wanted.clear();
        self.retained.clear();
        self.load_queue.clear();

        let hysteresis = i64::from(self.config.unload_hysteresis);
        for viewer in self.viewers.values() {
            let load = i64::from(viewer.distance);
            let keep = load + hysteresis;
            let load_sq = load * load;
            let keep_sq = keep * keep;
            for dx in -keep..=keep {
                for dz in -keep..=keep {
                    let dist_sq = dx * dx + dz * dz;
                    if dist_sq > keep_sq {
                        continue;
                    }
                    let step = i32::try_from(dx).ok().zip(i32::try_from(dz).ok());
                    let Some(pos) = step.and_then(|(dx, dz)| viewer.chunk.checked_offset(dx, dz))
                    else {
                        continue;
                    };
                    self.retained.insert(pos);
                    if dist_sq <= load_sq {
                        let entry = self.wanted.entry(pos).or_insert(dist_sq);
                        *entry = (*entry).min(dist_sq);
                    }
                }
            }
        }
        self.dirty = false;
        debug!(
            viewers = self.viewers.len(),
            wanted = self.wanted.len(),
            retained = self.retained.len(),
            "Recomputed chunk loading area"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::block::{BlockId, BlockState};
    use crate::changer::WorldBlockChanger;
    use crate::chunk::Chunk;
    use crate::creator::FlatGenerator;
    use crate::creator::test_support::finish_n;
    use crate::entity::test_support::Walker;

    fn p(cx: i32, cz: i32) -> ChunkPos {
        ChunkPos::from_chunk_coords(cx, cz)
    }

    fn creator() -> ChunkCreator {
        let source = Arc::new(FlatGenerator::new(vec![(1, BlockState::of(BlockId(0)))]));
        ChunkCreator::new(source, 16, 2, 1024).unwrap()
    }

    fn config(distance: u32, hysteresis: u32, budget: u32) -> ChunkLoadConfig {
        ChunkLoadConfig {
            chunk_loading_distance: distance,
            max_chunk_loading_distance: 16,
            unload_hysteresis: hysteresis,
            creates_per_tick: budget,
        }
    }

    fn circle_count(r: i64) -> usize {
        let mut n = 0;
        for dx in -r..=r {
            for dz in -r..=r {
                if dx * dx + dz * dz <= r * r {
                    n += 1;
                }
            }
        }
        n
    }

    /// Pre-creates every chunk in the square of radius `r` around the origin.
    fn populated(changer: &WorldBlockChanger, r: i32) -> WorldChunkHandler {
        let mut handler = WorldChunkHandler::new(16).unwrap();
        for cx in -r..=r {
            for cz in -r..=r {
                handler
                    .insert(Chunk::new(p(cx, cz), 16, changer.sender()).unwrap())
                    .unwrap();
            }
        }
        handler
    }

    #[test]
    fn test_existing_chunks_within_distance_load() {
        let changer = WorldBlockChanger::new();
        let mut handler = populated(&changer, 5);
        let creator = creator();
        let mut loader = ChunkLoader::new(config(2, 1, 8));
        loader.set_viewer(ViewerId(1), 8.0, 8.0);

        let result = loader.tick(&mut handler, &creator);
        assert_eq!(result.loaded.len(), circle_count(2));
        assert_eq!(handler.loaded_count(), circle_count(2));
        assert!(result.requested.is_empty());
        assert!(handler.is_loaded(p(2, 0)));
        assert!(!handler.is_loaded(p(2, 1)));
    }

    #[test]
    fn test_missing_chunks_requested_nearest_first_within_budget() {
        let changer = WorldBlockChanger::new();
        let mut handler = WorldChunkHandler::new(16).unwrap();
        let creator = creator();
        let mut loader = ChunkLoader::new(config(3, 0, 5));
        loader.set_viewer(ViewerId(1), 0.0, 0.0);

        let result = loader.tick(&mut handler, &creator);
        assert_eq!(result.requested.len(), 5);
        assert_eq!(result.requested[0], p(0, 0));
        for pos in &result.requested[1..] {
            assert_eq!(pos.distance_sq(p(0, 0)), 1, "ring 1 comes before ring 2");
        }

        // Created chunks load on a later tick.
        finish_n(&creator, &mut handler, &changer.sender(), 5);
        let result = loader.tick(&mut handler, &creator);
        assert_eq!(result.loaded.len(), 5);
    }

    #[test]
    fn test_hysteresis_band() {
        let changer = WorldBlockChanger::new();
        let mut handler = populated(&changer, 12);
        let creator = creator();
        let mut loader = ChunkLoader::new(config(4, 2, 0));
        loader.set_viewer(ViewerId(1), 0.0, 0.0);
        loader.tick(&mut handler, &creator);
        assert!(handler.is_loaded(p(4, 0)));

        // Chunk (4, 0) is now 6 away: inside 4 + 2, stays loaded.
        loader.set_viewer(ViewerId(1), -32.0, 0.0);
        let result = loader.tick(&mut handler, &creator);
        assert!(handler.is_loaded(p(4, 0)));
        assert!(!result.unloaded.contains(&p(4, 0)));

        // 7 away: unloaded.
        loader.set_viewer(ViewerId(1), -48.0, 0.0);
        let result = loader.tick(&mut handler, &creator);
        assert!(!handler.is_loaded(p(4, 0)));
        assert!(result.unloaded.contains(&p(4, 0)));
        assert!(handler.contains(p(4, 0)), "unloading never drops the chunk");
    }

    #[test]
    fn test_multiple_viewers_union() {
        let changer = WorldBlockChanger::new();
        let mut handler = populated(&changer, 12);
        let creator = creator();
        let mut loader = ChunkLoader::new(config(1, 0, 0));
        loader.set_viewer(ViewerId(1), 0.0, 0.0);
        loader.set_viewer(ViewerId(2), 160.0, 0.0);
        loader.tick(&mut handler, &creator);
        assert!(handler.is_loaded(p(0, 0)));
        assert!(handler.is_loaded(p(10, 0)));
        assert_eq!(handler.loaded_count(), 2 * circle_count(1));

        assert!(loader.remove_viewer(ViewerId(2)));
        let result = loader.tick(&mut handler, &creator);
        assert_eq!(result.unloaded.len(), circle_count(1));
        assert!(!handler.is_loaded(p(10, 0)));
    }

    #[test]
    fn test_distance_change_reevaluates() {
        let changer = WorldBlockChanger::new();
        let mut handler = populated(&changer, 12);
        let creator = creator();
        let mut loader = ChunkLoader::new(config(1, 0, 0));
        loader.set_viewer(ViewerId(1), 0.0, 0.0);
        loader.tick(&mut handler, &creator);
        assert_eq!(handler.loaded_count(), circle_count(1));

        assert_eq!(loader.set_viewer_distance(ViewerId(1), 3), Some(3));
        loader.tick(&mut handler, &creator);
        assert_eq!(handler.loaded_count(), circle_count(3));

        assert_eq!(loader.set_viewer_distance(ViewerId(1), 100), Some(16));
        assert_eq!(loader.set_viewer_distance(ViewerId(9), 2), None);
    }

    #[test]
    fn test_vetoed_unload_counted() {
        let changer = WorldBlockChanger::new();
        let mut handler = populated(&changer, 4);
        let creator = creator();
        let mut loader = ChunkLoader::new(config(0, 0, 0));
        loader.set_viewer(ViewerId(1), 0.0, 0.0);
        handler.load(p(3, 3)).unwrap();
        let mut walker = Walker::at(50.0, 50.0);
        walker.pinned = true;
        handler.get_mut(p(3, 3)).unwrap().add_entity(Box::new(walker));

        let result = loader.tick(&mut handler, &creator);
        assert_eq!(result.vetoed, 1);
        assert!(handler.is_loaded(p(3, 3)));
    }

    #[test]
    fn test_far_viewer_is_clamped_to_border() {
        let mut handler = WorldChunkHandler::new(16).unwrap();
        let creator = creator();
        let mut loader = ChunkLoader::new(config(2, 1, 4));
        assert!(loader.set_viewer(ViewerId(1), 3.0e9, -3.0e9));

        let result = loader.tick(&mut handler, &creator);
        let corner = ChunkPos::containing(WORLD_BORDER, -WORLD_BORDER);
        assert_eq!(result.requested[0], corner);
        assert!(loader.is_wanted(corner));
        assert!(!loader.is_wanted(p(0, 0)));
    }

    #[test]
    fn test_non_finite_viewer_ignored() {
        let mut handler = WorldChunkHandler::new(16).unwrap();
        let creator = creator();
        let mut loader = ChunkLoader::new(config(1, 0, 4));
        assert!(!loader.set_viewer(ViewerId(1), f64::NAN, 0.0));
        assert_eq!(loader.viewer_count(), 0);

        assert!(loader.set_viewer(ViewerId(1), 0.0, 0.0));
        assert!(!loader.set_viewer(ViewerId(1), 0.0, f64::INFINITY));
        loader.tick(&mut handler, &creator);
        assert!(loader.is_wanted(p(0, 0)));
    }

    #[test]
    fn test_priority_queue_orders_by_distance() {
        let mut queue = ChunkLoadQueue::new();
        queue.enqueue(p(5, 0), 25);
        queue.enqueue(p(2, 0), 4);
        queue.enqueue(p(8, 0), 64);
        queue.enqueue(p(1, 0), 1);
        queue.enqueue(p(1, 0), 1);

        let mut distances = Vec::new();
        while let Some((dist_sq, _)) = queue.dequeue() {
            distances.push(dist_sq);
        }
        assert_eq!(distances, vec![1, 4, 25, 64]);
    }
}
