//! Block state palettes: bijections between block states and dense indices.

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::block::BlockState;

/// Errors from palette lookups.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaletteError {
    #[error("palette index {index} out of range (palette has {len} keys)")]
    IndexOutOfRange { index: u32, len: usize },
    #[error("block state {0:?} is not in the palette")]
    UnknownState(Option<BlockState>),
    #[error("block state {0:?} appears twice in the palette")]
    Duplicate(Option<BlockState>),
}

/// Bidirectional mapping between block states (`None` = air) and indices
/// `0..num_keys()`.
pub trait BlockStatePalette {
    /// State stored at `index`.
    fn instance(&self, index: u32) -> Result<Option<BlockState>, PaletteError>;

    /// Index of `state`.
    fn index_of(&self, state: Option<BlockState>) -> Result<u32, PaletteError>;

    /// Number of distinct states in the palette.
    fn num_keys(&self) -> usize;
}

/// Palette backed by an ordered list plus a reverse hash index.
///
/// Indices are assigned in insertion order and never change afterwards.
#[derive(Clone, Debug, Default)]
pub struct IndexedBlockStatePalette {
    states: Vec<Option<BlockState>>,
    indices: FxHashMap<Option<BlockState>, u32>,
}

impl IndexedBlockStatePalette {
    /// Builds a palette from `states`, dropping repeats after their first
    /// occurrence.
    pub fn new(states: impl IntoIterator<Item = Option<BlockState>>) -> Self {
        let mut palette = Self::default();
        for state in states {
            palette.push(state);
        }
        palette
    }

    /// Builds a palette whose index 0 is air, followed by the observed
    /// non-air states in first-seen order.
    pub fn with_air(observed: impl IntoIterator<Item = Option<BlockState>>) -> Self {
        Self::new(std::iter::once(None).chain(observed))
    }

    /// Builds a palette that must match `states` position for position.
    ///
    /// Unlike [`new`](Self::new), repeats are an error since they would make
    /// the palette shorter than the list that describes it.
    pub fn from_exact(states: Vec<Option<BlockState>>) -> Result<Self, PaletteError> {
        let mut indices = FxHashMap::default();
        for (i, state) in states.iter().enumerate() {
            if indices.insert(*state, i as u32).is_some() {
                return Err(PaletteError::Duplicate(*state));
            }
        }
        Ok(Self { states, indices })
    }

    fn push(&mut self, state: Option<BlockState>) {
        if !self.indices.contains_key(&state) {
            self.indices.insert(state, self.states.len() as u32);
            self.states.push(state);
        }
    }

    /// For every local index `i`, the index of `self.instance(i)` in `other`.
    ///
    /// Fails if `other` lacks any state of this palette.
    pub fn instance_indices(
        &self,
        other: &impl BlockStatePalette,
    ) -> Result<Vec<u32>, PaletteError> {
        self.states.iter().map(|s| other.index_of(*s)).collect()
    }

    /// Whether `state` has an index in this palette.
    pub fn contains(&self, state: Option<BlockState>) -> bool {
        self.indices.contains_key(&state)
    }

    /// States in index order.
    pub fn states(&self) -> &[Option<BlockState>] {
        &self.states
    }
}

impl PartialEq for IndexedBlockStatePalette {
    fn eq(&self, other: &Self) -> bool {
        self.states == other.states
    }
}

impl Eq for IndexedBlockStatePalette {}

impl BlockStatePalette for IndexedBlockStatePalette {
    fn instance(&self, index: u32) -> Result<Option<BlockState>, PaletteError> {
        self.states
            .get(index as usize)
            .copied()
            .ok_or(PaletteError::IndexOutOfRange {
                index,
                len: self.states.len(),
            })
    }

    fn index_of(&self, state: Option<BlockState>) -> Result<u32, PaletteError> {
        self.indices
            .get(&state)
            .copied()
            .ok_or(PaletteError::UnknownState(state))
    }

    fn num_keys(&self) -> usize {
        self.states.len()
    }
}
