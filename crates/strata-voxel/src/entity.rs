//! Entities living inside chunks.
//!
//! Chunks own their entities. Each world tick every loaded chunk ticks its
//! entities once, then hands back any entity whose position left the chunk
//! footprint so the handler can move it to its new chunk.

use crate::chunk::ChunkPos;

/// Behaviour the world needs from anything stored in a chunk.
pub trait Entity: Send {
    /// World position in blocks.
    fn position(&self) -> [f64; 3];

    /// Advances the entity by one world tick.
    fn tick(&mut self, tick_id: u64);

    /// Return `true` to sit out the current tick.
    fn skip_tick(&mut self) -> bool {
        false
    }

    /// Whether the containing chunk may be unloaded while this entity is in it.
    fn allow_chunk_unload(&self) -> bool {
        true
    }

    fn is_dead(&self) -> bool {
        false
    }

    /// Runs once, right before a dead entity is dropped from its chunk.
    fn on_death(&mut self) {}

    /// Runs after the entity moved from chunk `from` into chunk `to`.
    fn on_chunk_changed(&mut self, _from: ChunkPos, _to: ChunkPos) {}
}

/// An entity plus the id of the last tick it ran in.
///
/// The stamp stops an entity that transfers into a chunk ticked later in
/// the same world tick from running twice.
pub struct TrackedEntity {
    entity: Box<dyn Entity>,
    last_tick: Option<u64>,
}

impl TrackedEntity {
    pub fn new(entity: Box<dyn Entity>) -> Self {
        Self {
            entity,
            last_tick: None,
        }
    }

    /// Ticks the entity unless it already ran in `tick_id` or asks to skip.
    /// Returns whether `Entity::tick` was called.
    pub fn tick_once(&mut self, tick_id: u64) -> bool {
        if self.last_tick == Some(tick_id) {
            return false;
        }
        self.last_tick = Some(tick_id);
        if self.entity.skip_tick() {
            return false;
        }
        self.entity.tick(tick_id);
        true
    }

    pub fn entity(&self) -> &dyn Entity {
        self.entity.as_ref()
    }

    pub fn entity_mut(&mut self) -> &mut dyn Entity {
        self.entity.as_mut()
    }

    pub fn into_inner(self) -> Box<dyn Entity> {
        self.entity
    }
}

impl std::fmt::Debug for TrackedEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedEntity")
            .field("position", &self.entity.position())
            .field("last_tick", &self.last_tick)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    /// Entity that walks `step` blocks along +x every tick.
    pub struct Walker {
        pub pos: [f64; 3],
        pub step: f64,
        pub ticks: Arc<AtomicU32>,
        pub transfers: Arc<AtomicU32>,
        pub pinned: bool,
        pub dead: bool,
        pub skip: bool,
    }

    impl Walker {
        pub fn at(x: f64, z: f64) -> Self {
            Self {
                pos: [x, 64.0, z],
                step: 0.0,
                ticks: Arc::new(AtomicU32::new(0)),
                transfers: Arc::new(AtomicU32::new(0)),
                pinned: false,
                dead: false,
                skip: false,
            }
        }
    }

    impl Entity for Walker {
        fn position(&self) -> [f64; 3] {
            self.pos
        }

        fn tick(&mut self, _tick_id: u64) {
            self.pos[0] += self.step;
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }

        fn skip_tick(&mut self) -> bool {
            self.skip
        }

        fn allow_chunk_unload(&self) -> bool {
            !self.pinned
        }

        fn is_dead(&self) -> bool {
            self.dead
        }

        fn on_chunk_changed(&mut self, _from: ChunkPos, _to: ChunkPos) {
            self.transfers.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::test_support::Walker;
    use super::*;

    #[test]
    fn test_tick_once_per_tick_id() {
        let walker = Walker::at(1.0, 1.0);
        let ticks = walker.ticks.clone();
        let mut tracked = TrackedEntity::new(Box::new(walker));
        assert!(tracked.tick_once(7));
        assert!(!tracked.tick_once(7));
        assert!(tracked.tick_once(8));
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_skip_tick_suppresses_tick() {
        let mut walker = Walker::at(0.0, 0.0);
        walker.skip = true;
        let ticks = walker.ticks.clone();
        let mut tracked = TrackedEntity::new(Box::new(walker));
        assert!(!tracked.tick_once(1));
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }
}
