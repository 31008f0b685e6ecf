//! Builds the mesh of one section from a snapshot.

use std::sync::atomic::{AtomicBool, Ordering};

use strata_voxel::{BlockSource, CHUNK_SIZE, SECTION_HEIGHT};

use crate::chunk_mesh::ChunkMesh;
use crate::error::MeshError;
use crate::face_direction::FaceDirection;
use crate::render::MeshableRegistry;
use crate::snapshot::SectionSnapshot;

/// Meshes every non-air cell of `snapshot` that touches a see-through
/// neighbour.
///
/// Returns `Ok(None)` when nothing is visible. `cancel` is polled once per
/// column; once set the build stops with [`MeshError::Cancelled`].
pub fn build_section_mesh(
    snapshot: &SectionSnapshot,
    registry: &dyn MeshableRegistry,
    cancel: &AtomicBool,
) -> Result<Option<ChunkMesh>, MeshError> {
    if snapshot.is_released() {
        return Err(MeshError::Storage(strata_voxel::StorageError::Released));
    }
    let mut mesh = ChunkMesh::new();
    for x in 0..CHUNK_SIZE {
        for z in 0..CHUNK_SIZE {
            if cancel.load(Ordering::Relaxed) {
                return Err(MeshError::Cancelled);
            }
            for y in 0..SECTION_HEIGHT {
                let Some(state) = snapshot.block_state(x, y, z) else {
                    continue;
                };
                let exposed = FaceDirection::ALL.iter().any(|dir| {
                    let (nx, ny, nz) = dir.offset(x, y, z);
                    registry.is_see_through(snapshot.block_state(nx, ny, nz))
                });
                if exposed {
                    registry.render(&mut mesh, x, y, z, snapshot, state)?;
                }
            }
        }
    }
    Ok((!mesh.is_empty()).then_some(mesh))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use strata_voxel::{BlockDef, BlockRegistry, ChunkPos, SectionKey};

    use super::*;
    use crate::render::CubeRenderer;
    use crate::snapshot::test_support::*;

    fn renderer() -> CubeRenderer {
        let registry = BlockRegistry::from_defs([
            BlockDef::opaque("stone"),
            BlockDef::opaque("glass")
                .with_transparency(strata_voxel::Transparency::FullyTransparent),
        ])
        .unwrap();
        CubeRenderer::new(Arc::new(registry))
    }

    fn section(cx: i32, cz: i32, index: usize) -> SectionKey {
        SectionKey::new(ChunkPos::from_chunk_coords(cx, cz), index)
    }

    #[test]
    fn test_empty_section_needs_no_mesh() {
        let handler = handler_with(&[(0, 0)], |_, _, _| None);
        let snapshot = SectionSnapshot::capture(&handler, section(0, 0, 0)).unwrap();
        let mesh = build_section_mesh(&snapshot, &renderer(), &AtomicBool::new(false)).unwrap();
        assert!(mesh.is_none());
    }

    #[test]
    fn test_single_block_gets_six_faces() {
        let handler = handler_with(&[(0, 0)], |x, y, z| (x == 4 && y == 4 && z == 4).then(stone));
        let snapshot = SectionSnapshot::capture(&handler, section(0, 0, 0)).unwrap();
        let mesh = build_section_mesh(&snapshot, &renderer(), &AtomicBool::new(false))
            .unwrap()
            .unwrap();
        assert_eq!(mesh.face_count(), 6);
    }

    #[test]
    fn test_solid_section_surrounded_by_stone_has_no_faces() {
        // A 3x3 patch of solid chunks: section 0 of the middle chunk is
        // enclosed on every side but the bottom.
        let mut chunks = Vec::new();
        for cx in -1..=1 {
            for cz in -1..=1 {
                chunks.push((cx, cz));
            }
        }
        let handler = handler_with(&chunks, |_, _, _| Some(stone()));
        let snapshot = SectionSnapshot::capture(&handler, section(0, 0, 0)).unwrap();
        let mesh = build_section_mesh(&snapshot, &renderer(), &AtomicBool::new(false))
            .unwrap()
            .unwrap();
        assert_eq!(mesh.face_count(), 256);
        assert_eq!(mesh.faces_facing(FaceDirection::NegY), 256);
    }

    #[test]
    fn test_cancel_flag_stops_build() {
        let handler = handler_with(&[(0, 0)], |_, _, _| Some(stone()));
        let snapshot = SectionSnapshot::capture(&handler, section(0, 0, 0)).unwrap();
        let result = build_section_mesh(&snapshot, &renderer(), &AtomicBool::new(true));
        assert!(matches!(result, Err(MeshError::Cancelled)));
    }

    #[test]
    fn test_released_snapshot_is_rejected() {
        let handler = handler_with(&[(0, 0)], |_, _, _| Some(stone()));
        let mut snapshot = SectionSnapshot::capture(&handler, section(0, 0, 0)).unwrap();
        snapshot.release();
        let result = build_section_mesh(&snapshot, &renderer(), &AtomicBool::new(false));
        assert!(matches!(result, Err(MeshError::Storage(_))));
    }
}
