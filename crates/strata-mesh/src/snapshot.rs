//! Owned copies of a section and its face neighbours for off-thread meshing.
//!
//! Meshing never reads live chunk data. The world thread captures a
//! [`SectionSnapshot`] and hands it to a worker; the worker reads only the
//! copy and releases it when done.

use strata_voxel::{
    BlockSource, BlockState, BlockStateStorage, CHUNK_SIZE, SECTION_HEIGHT, SectionKey,
    WorldChunkHandler,
};

use crate::error::MeshError;
use crate::face_direction::FaceDirection;

/// Deep copy of one section plus up to six face-adjacent sections.
///
/// Reads through [`BlockSource`] use section-local coordinates. A cell one
/// step outside the section on a single axis is read from the matching
/// neighbour copy; anything further out, or any missing neighbour, reads as
/// air.
#[derive(Debug)]
pub struct SectionSnapshot {
    key: SectionKey,
    center: BlockStateStorage,
    neighbors: [Option<BlockStateStorage>; 6],
}

impl SectionSnapshot {
    /// Copies section `key` and whichever neighbours exist in `handler`.
    pub fn capture(handler: &WorldChunkHandler, key: SectionKey) -> Result<Self, MeshError> {
        let section = handler
            .get(key.chunk)
            .and_then(|chunk| chunk.section(key.section))
            .ok_or(MeshError::UnknownSection(key))?;
        let center = section.to_storage()?;

        let mut neighbors: [Option<BlockStateStorage>; 6] = Default::default();
        for dir in FaceDirection::ALL {
            let Some(adjacent) = dir.adjacent_section(key) else {
                continue;
            };
            if let Some(section) = handler
                .get(adjacent.chunk)
                .and_then(|chunk| chunk.section(adjacent.section))
            {
                neighbors[dir.index()] = Some(section.to_storage()?);
            }
        }

        Ok(Self {
            key,
            center,
            neighbors,
        })
    }

    /// Builds a snapshot from storages already copied by the caller.
    pub fn from_parts(
        key: SectionKey,
        center: BlockStateStorage,
        neighbors: [Option<BlockStateStorage>; 6],
    ) -> Self {
        Self {
            key,
            center,
            neighbors,
        }
    }

    pub fn key(&self) -> SectionKey {
        self.key
    }

    pub fn center(&self) -> &BlockStateStorage {
        &self.center
    }

    pub fn neighbor(&self, dir: FaceDirection) -> Option<&BlockStateStorage> {
        self.neighbors[dir.index()].as_ref()
    }

    /// Number of neighbour sections that were captured.
    pub fn neighbor_count(&self) -> usize {
        self.neighbors.iter().flatten().count()
    }

    /// Frees every copied storage. Safe to call more than once.
    pub fn release(&mut self) {
        self.center.delete();
        for storage in self.neighbors.iter_mut().flatten() {
            storage.delete();
        }
    }

    pub fn is_released(&self) -> bool {
        self.center.is_deleted()
    }
}

impl BlockSource for SectionSnapshot {
    fn block_state(&self, x: i32, y: i32, z: i32) -> Option<BlockState> {
        let in_x = (0..CHUNK_SIZE).contains(&x);
        let in_y = (0..SECTION_HEIGHT).contains(&y);
        let in_z = (0..CHUNK_SIZE).contains(&z);

        let (storage, x, y, z) = match (in_x, in_y, in_z) {
            (true, true, true) => (Some(&self.center), x, y, z),
            (false, true, true) if x == -1 => (self.neighbor(FaceDirection::NegX), CHUNK_SIZE - 1, y, z),
            (false, true, true) if x == CHUNK_SIZE => (self.neighbor(FaceDirection::PosX), 0, y, z),
            (true, false, true) if y == -1 => (self.neighbor(FaceDirection::NegY), x, SECTION_HEIGHT - 1, z),
            (true, false, true) if y == SECTION_HEIGHT => (self.neighbor(FaceDirection::PosY), x, 0, z),
            (true, true, false) if z == -1 => (self.neighbor(FaceDirection::NegZ), x, y, CHUNK_SIZE - 1),
            (true, true, false) if z == CHUNK_SIZE => (self.neighbor(FaceDirection::PosZ), x, y, 0),
            _ => return None,
        };
        // Released storages read as air.
        storage.and_then(|s| s.get(x, y, z).ok().flatten())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod test_support {
    use strata_voxel::{BlockId, Chunk, ChunkPos, WorldBlockChanger};

    use super::*;

    pub(crate) fn stone() -> BlockState {
        BlockState::of(BlockId(0))
    }

    pub(crate) fn glass() -> BlockState {
        BlockState::of(BlockId(1))
    }

    /// Handler holding loaded 32-high chunks at each of `chunks`, filled by `fill`
    /// with world coordinates.
    pub(crate) fn handler_with(
        chunks: &[(i32, i32)],
        fill: impl Fn(i32, i32, i32) -> Option<BlockState>,
    ) -> WorldChunkHandler {
        let changer = WorldBlockChanger::new();
        let mut handler = WorldChunkHandler::new(32).unwrap();
        for &(cx, cz) in chunks {
            let origin = ChunkPos::from_chunk_coords(cx, cz);
            let mut chunk = Chunk::new(origin, 32, changer.sender()).unwrap();
            for x in origin.x()..origin.x() + CHUNK_SIZE {
                for z in origin.z()..origin.z() + CHUNK_SIZE {
                    for y in 0..32 {
                        if let Some(state) = fill(x, y, z) {
                            chunk.set_block_untracked(x, y, z, Some(state)).unwrap();
                        }
                    }
                }
            }
            handler.insert(chunk).unwrap();
            handler.load(origin).unwrap();
        }
        handler
    }
}

#[cfg(test)]
mod tests {
    use strata_voxel::ChunkPos;

    use super::test_support::*;
    use super::*;

    fn key(cx: i32, cz: i32, section: usize) -> SectionKey {
        SectionKey::new(ChunkPos::from_chunk_coords(cx, cz), section)
    }

    #[test]
    fn test_capture_unknown_section() {
        let handler = handler_with(&[(0, 0)], |_, _, _| None);
        assert!(matches!(
            SectionSnapshot::capture(&handler, key(5, 5, 0)),
            Err(MeshError::UnknownSection(_))
        ));
        assert!(matches!(
            SectionSnapshot::capture(&handler, key(0, 0, 2)),
            Err(MeshError::UnknownSection(_))
        ));
    }

    #[test]
    fn test_neighbor_count_at_world_edge() {
        let handler = handler_with(&[(0, 0), (1, 0)], |_, _, _| None);
        // Section 0 of (0,0): east chunk and the section above exist.
        let snapshot = SectionSnapshot::capture(&handler, key(0, 0, 0)).unwrap();
        assert_eq!(snapshot.neighbor_count(), 2);
        assert!(snapshot.neighbor(FaceDirection::PosX).is_some());
        assert!(snapshot.neighbor(FaceDirection::PosY).is_some());
        assert!(snapshot.neighbor(FaceDirection::NegY).is_none());
    }

    #[test]
    fn test_reads_cross_into_neighbors() {
        let handler = handler_with(&[(0, 0), (1, 0)], |x, y, _| match (x, y) {
            (16, 3) => Some(glass()),
            (_, 16) => Some(stone()),
            _ => None,
        });
        let snapshot = SectionSnapshot::capture(&handler, key(0, 0, 0)).unwrap();
        assert_eq!(snapshot.block_state(16, 3, 7), Some(glass()));
        assert_eq!(snapshot.block_state(4, 16, 4), Some(stone()));
        assert_eq!(snapshot.block_state(4, -1, 4), None);
        // Edge and corner cells are never read from neighbours.
        assert_eq!(snapshot.block_state(16, 16, 0), None);
    }

    #[test]
    fn test_snapshot_is_independent_of_live_chunk() {
        let origin = ChunkPos::from_chunk_coords(0, 0);
        let mut handler = handler_with(&[(0, 0)], |_, y, _| (y == 0).then(stone));
        let snapshot = SectionSnapshot::capture(&handler, key(0, 0, 0)).unwrap();

        handler.unload(origin).unwrap();
        handler
            .get_mut(origin)
            .unwrap()
            .set_block_untracked(0, 0, 0, None)
            .unwrap();

        assert_eq!(handler.block_state(0, 0, 0), None);
        assert_eq!(snapshot.block_state(0, 0, 0), Some(stone()));
    }

    #[test]
    fn test_release_frees_all_copies() {
        let handler = handler_with(&[(0, 0), (0, 1)], |_, _, _| Some(stone()));
        let mut snapshot = SectionSnapshot::capture(&handler, key(0, 0, 1)).unwrap();
        assert_eq!(snapshot.neighbor_count(), 2);
        snapshot.release();
        assert!(snapshot.is_released());
        assert!(snapshot.neighbor(FaceDirection::PosZ).unwrap().is_deleted());
        assert!(snapshot.neighbor(FaceDirection::NegY).unwrap().is_deleted());
        assert_eq!(snapshot.block_state(0, 0, 0), None);
        snapshot.release();
    }
}
