//! Determines which section meshes go stale after a block edit.

use crate::block::BlockPos;
use crate::chunk::{CHUNK_SIZE, ChunkPos, Direction, SECTION_HEIGHT, SectionKey};

/// Maps block edits to the sections whose meshes depend on them.
pub struct SectionInvalidator;

impl SectionInvalidator {
    /// Sections to rebuild after the block at `pos` changed in a world of
    /// `height` blocks.
    ///
    /// The containing section always comes first. Neighbouring sections
    /// follow when the edit sits on a section face, since their face culling
    /// reads the edited cell. Sections past the top or bottom of the world
    /// are never produced.
    pub fn invalidate(pos: BlockPos, height: i32) -> Vec<SectionKey> {
        let chunk = ChunkPos::containing(pos.x, pos.z);
        let section = pos.y.div_euclid(SECTION_HEIGHT);
        let home = SectionKey::new(chunk, section as usize);
        let mut dirty = vec![home];

        let lx = pos.x - chunk.x();
        let lz = pos.z - chunk.z();
        let ly = pos.y.rem_euclid(SECTION_HEIGHT);

        if ly == 0 && section > 0 {
            dirty.push(SectionKey::new(chunk, section as usize - 1));
        }
        if ly == SECTION_HEIGHT - 1 && (section + 1) * SECTION_HEIGHT < height {
            dirty.push(SectionKey::new(chunk, section as usize + 1));
        }

        let edges = [
            (lz == 0, Direction::North),
            (lz == CHUNK_SIZE - 1, Direction::South),
            (lx == 0, Direction::West),
            (lx == CHUNK_SIZE - 1, Direction::East),
        ];
        for (on_edge, dir) in edges {
            if on_edge {
                dirty.push(SectionKey::new(chunk.neighbor(dir), home.section));
            }
        }

        dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interior_edit_only_dirties_own_section() {
        let dirty = SectionInvalidator::invalidate(BlockPos::new(5, 40, 5), 64);
        assert_eq!(
            dirty,
            vec![SectionKey::new(ChunkPos::from_chunk_coords(0, 0), 2)]
        );
    }

    #[test]
    fn test_vertical_faces() {
        let origin = ChunkPos::from_chunk_coords(0, 0);
        let dirty = SectionInvalidator::invalidate(BlockPos::new(5, 32, 5), 64);
        assert_eq!(dirty, vec![SectionKey::new(origin, 2), SectionKey::new(origin, 1)]);

        let dirty = SectionInvalidator::invalidate(BlockPos::new(5, 31, 5), 64);
        assert_eq!(dirty, vec![SectionKey::new(origin, 1), SectionKey::new(origin, 2)]);
    }

    #[test]
    fn test_world_bounds_are_not_crossed() {
        let origin = ChunkPos::from_chunk_coords(0, 0);
        let bottom = SectionInvalidator::invalidate(BlockPos::new(5, 0, 5), 64);
        assert_eq!(bottom, vec![SectionKey::new(origin, 0)]);
        let top = SectionInvalidator::invalidate(BlockPos::new(5, 63, 5), 64);
        assert_eq!(top, vec![SectionKey::new(origin, 3)]);
    }

    #[test]
    fn test_horizontal_edges_reach_neighbour_chunks() {
        let origin = ChunkPos::from_chunk_coords(0, 0);
        let dirty = SectionInvalidator::invalidate(BlockPos::new(0, 8, 15), 64);
        assert!(dirty.contains(&SectionKey::new(origin.neighbor(Direction::West), 0)));
        assert!(dirty.contains(&SectionKey::new(origin.neighbor(Direction::South), 0)));
        assert_eq!(dirty.len(), 3);
    }

    #[test]
    fn test_negative_coordinates() {
        let dirty = SectionInvalidator::invalidate(BlockPos::new(-1, 5, -16), 64);
        let chunk = ChunkPos::from_chunk_coords(-1, -1);
        assert_eq!(dirty[0], SectionKey::new(chunk, 0));
        assert!(dirty.contains(&SectionKey::new(chunk.neighbor(Direction::East), 0)));
        assert!(dirty.contains(&SectionKey::new(chunk.neighbor(Direction::North), 0)));
    }
}
