//! Bitmask for tracking which of a block's six faces are visible.

use strata_voxel::{BlockSource, BlockState};

use crate::face_direction::FaceDirection;

/// Bitmask indicating which of a block's 6 faces are visible.
///
/// Bit 0 = +X, Bit 1 = -X, Bit 2 = +Y, Bit 3 = -Y, Bit 4 = +Z, Bit 5 = -Z.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VisibleFaces(pub u8);

impl VisibleFaces {
    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self(0b0011_1111);

    pub fn is_visible(self, direction: FaceDirection) -> bool {
        self.0 & (1 << direction as u8) != 0
    }

    pub fn set_visible(&mut self, direction: FaceDirection) {
        self.0 |= 1 << direction as u8;
    }

    /// Returns the number of visible faces (0-6).
    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Faces of `state` at `(x, y, z)` that need geometry.
    ///
    /// A face shows when its neighbour is see-through, except between two
    /// see-through cells holding the same state, which hide their shared face.
    pub fn compute(
        blocks: &dyn BlockSource,
        x: i32,
        y: i32,
        z: i32,
        state: BlockState,
        see_through: impl Fn(Option<BlockState>) -> bool,
    ) -> Self {
        let self_see_through = see_through(Some(state));
        let mut faces = Self::NONE;
        for dir in FaceDirection::ALL {
            let (nx, ny, nz) = dir.offset(x, y, z);
            let neighbor = blocks.block_state(nx, ny, nz);
            if !see_through(neighbor) {
                continue;
            }
            if self_see_through && neighbor == Some(state) {
                continue;
            }
            faces.set_visible(dir);
        }
        faces
    }
}

#[cfg(test)]
mod tests {
    use strata_voxel::BlockId;

    use super::*;

    const STONE: BlockState = BlockState::of(BlockId(0));
    const GLASS: BlockState = BlockState::of(BlockId(1));

    /// Cells listed explicitly; everything else is air.
    struct Cells(Vec<([i32; 3], BlockState)>);

    impl BlockSource for Cells {
        fn block_state(&self, x: i32, y: i32, z: i32) -> Option<BlockState> {
            self.0.iter().find(|(p, _)| *p == [x, y, z]).map(|(_, s)| *s)
        }
    }

    fn see_through(state: Option<BlockState>) -> bool {
        state != Some(STONE)
    }

    #[test]
    fn test_set_and_query_individual_face() {
        let mut vf = VisibleFaces::NONE;
        vf.set_visible(FaceDirection::PosZ);
        assert!(vf.is_visible(FaceDirection::PosZ));
        assert!(!vf.is_visible(FaceDirection::NegZ));
        assert_eq!(vf.count(), 1);
    }

    #[test]
    fn test_isolated_block_shows_all_faces() {
        let cells = Cells(vec![([1, 1, 1], STONE)]);
        let faces = VisibleFaces::compute(&cells, 1, 1, 1, STONE, see_through);
        assert_eq!(faces, VisibleFaces::ALL);
    }

    #[test]
    fn test_opaque_neighbor_hides_face() {
        let cells = Cells(vec![([1, 1, 1], STONE), ([2, 1, 1], STONE)]);
        let faces = VisibleFaces::compute(&cells, 1, 1, 1, STONE, see_through);
        assert!(!faces.is_visible(FaceDirection::PosX));
        assert_eq!(faces.count(), 5);
    }

    #[test]
    fn test_same_see_through_state_hides_shared_face() {
        let cells = Cells(vec![([1, 1, 1], GLASS), ([1, 2, 1], GLASS), ([1, 0, 1], STONE)]);
        let faces = VisibleFaces::compute(&cells, 1, 1, 1, GLASS, see_through);
        assert!(!faces.is_visible(FaceDirection::PosY));
        assert!(!faces.is_visible(FaceDirection::NegY));
        assert_eq!(faces.count(), 4);

        // Stone next to glass still shows that face.
        let faces = VisibleFaces::compute(&cells, 1, 0, 1, STONE, see_through);
        assert!(faces.is_visible(FaceDirection::PosY));
    }
}
