//! Block identity: a block type plus a variant (facing, growth stage, ...).
//!
//! A world cell is an `Option<BlockState>`; `None` is air. Air has no
//! registry entry and always occupies index 0 of every palette.

use serde::{Deserialize, Serialize};

/// Compact identifier for a registered block type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u16);

/// Immutable identity of a block in one of its variants.
///
/// Two states are equal when both the block and the variant match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockState {
    /// Registered block type.
    pub block: BlockId,
    /// Variant index, `0..variants` of the block definition.
    pub variant: u8,
}

impl BlockState {
    /// Creates a state for `block` in `variant`.
    pub const fn new(block: BlockId, variant: u8) -> Self {
        Self { block, variant }
    }

    /// The default (variant 0) state of `block`.
    pub const fn of(block: BlockId) -> Self {
        Self::new(block, 0)
    }

    /// Same block, different variant.
    pub const fn with_variant(self, variant: u8) -> Self {
        Self::new(self.block, variant)
    }
}

/// Integer block position in world coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }
}

/// Read access to block states by integer position.
///
/// Anything outside the source's extent reads as air.
pub trait BlockSource {
    fn block_state(&self, x: i32, y: i32, z: i32) -> Option<BlockState>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_equality_includes_variant() {
        let a = BlockState::of(BlockId(3));
        let b = a.with_variant(1);
        assert_ne!(a, b);
        assert_eq!(a, BlockState::new(BlockId(3), 0));
        assert_eq!(b.block, a.block);
    }

    #[test]
    fn test_air_is_none() {
        let cell: Option<BlockState> = None;
        assert!(cell.is_none());
        // Air orders before every real state, which palettes rely on.
        assert!(cell < Some(BlockState::of(BlockId(0))));
    }
}
