//! The six axis-aligned directions a block face can point.

use strata_voxel::SectionKey;

/// Direction a block face points. The discriminant is the bit index used by
/// [`super::VisibleFaces`] and the slot index of a snapshot's neighbours.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FaceDirection {
    /// East.
    PosX = 0,
    NegX = 1,
    /// Up.
    PosY = 2,
    NegY = 3,
    /// South.
    PosZ = 4,
    NegZ = 5,
}

/// Unit step per direction, indexed by discriminant.
const STEPS: [[i32; 3]; 6] = [
    [1, 0, 0],
    [-1, 0, 0],
    [0, 1, 0],
    [0, -1, 0],
    [0, 0, 1],
    [0, 0, -1],
];

impl FaceDirection {
    pub const ALL: [FaceDirection; 6] = [
        Self::PosX,
        Self::NegX,
        Self::PosY,
        Self::NegY,
        Self::PosZ,
        Self::NegZ,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn step(self) -> [i32; 3] {
        STEPS[self.index()]
    }

    /// `(normal_axis, u_axis, v_axis)` with 0 = X, 1 = Y, 2 = Z. The last two
    /// span the face plane.
    pub fn sweep_axes(self) -> (usize, usize, usize) {
        match self {
            Self::PosX | Self::NegX => (0, 2, 1),
            Self::PosY | Self::NegY => (1, 0, 2),
            Self::PosZ | Self::NegZ => (2, 0, 1),
        }
    }

    pub fn normal(self) -> [f32; 3] {
        self.step().map(|c| c as f32)
    }

    /// Coordinates of the cell across this face from `(x, y, z)`.
    pub fn offset(self, x: i32, y: i32, z: i32) -> (i32, i32, i32) {
        let [dx, dy, dz] = self.step();
        (x + dx, y + dy, z + dz)
    }

    /// The section across this face from `key`. `None` below section 0;
    /// the world top is not checked here.
    pub fn adjacent_section(self, key: SectionKey) -> Option<SectionKey> {
        let [dx, dy, dz] = self.step();
        let section = key.section.checked_add_signed(dy as isize)?;
        Some(SectionKey::new(key.chunk.offset(dx, dz), section))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_voxel::ChunkPos;

    #[test]
    fn test_steps_are_unit_and_paired() {
        for pair in FaceDirection::ALL.chunks(2) {
            let [a, b] = [pair[0].step(), pair[1].step()];
            assert_eq!(a.iter().map(|c| c.abs()).sum::<i32>(), 1);
            assert_eq!(a.map(|c| -c), b);
        }
    }

    #[test]
    fn test_offset_crosses_zero() {
        assert_eq!(FaceDirection::NegX.offset(0, 4, 9), (-1, 4, 9));
        assert_eq!(FaceDirection::PosZ.offset(3, 3, -1), (3, 3, 0));
    }

    #[test]
    fn test_normal_lies_on_normal_axis() {
        for dir in FaceDirection::ALL {
            let (axis, u, v) = dir.sweep_axes();
            let n = dir.normal();
            assert_eq!(n[axis].abs(), 1.0);
            assert_eq!((n[u], n[v]), (0.0, 0.0));
        }
    }

    #[test]
    fn test_adjacent_section() {
        let key = SectionKey::new(ChunkPos::from_chunk_coords(2, -1), 0);
        assert_eq!(
            FaceDirection::PosX.adjacent_section(key),
            Some(SectionKey::new(ChunkPos::from_chunk_coords(3, -1), 0))
        );
        assert_eq!(
            FaceDirection::NegZ.adjacent_section(key),
            Some(SectionKey::new(ChunkPos::from_chunk_coords(2, -2), 0))
        );
        assert_eq!(
            FaceDirection::PosY.adjacent_section(key),
            Some(SectionKey::new(key.chunk, 1))
        );
        assert_eq!(FaceDirection::NegY.adjacent_section(key), None);
    }
}
