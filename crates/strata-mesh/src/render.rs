//! The render-registry capability consumed by the meshing pipeline.

use std::sync::Arc;

use strata_voxel::{BlockRegistry, BlockSource, BlockState};

use crate::chunk_mesh::ChunkMesh;
use crate::error::MeshError;
use crate::face_direction::FaceDirection;
use crate::visible_faces::VisibleFaces;

/// Emits geometry for single blocks.
///
/// Implementations are shared by every mesh worker.
pub trait MeshableRegistry: Send + Sync {
    /// Whether a face beside `state` can be seen. Air must be see-through.
    fn is_see_through(&self, state: Option<BlockState>) -> bool;

    /// Appends the geometry of `state` at section-local `(x, y, z)` to
    /// `mesh`, reading neighbours from `blocks`.
    ///
    /// Returns whether any face was emitted.
    fn render(
        &self,
        mesh: &mut ChunkMesh,
        x: i32,
        y: i32,
        z: i32,
        blocks: &dyn BlockSource,
        state: BlockState,
    ) -> Result<bool, MeshError>;
}

/// Renders every registered block as a unit cube with culled faces.
#[derive(Clone, Debug)]
pub struct CubeRenderer {
    registry: Arc<BlockRegistry>,
}

impl CubeRenderer {
    pub fn new(registry: Arc<BlockRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &BlockRegistry {
        &self.registry
    }
}

impl MeshableRegistry for CubeRenderer {
    fn is_see_through(&self, state: Option<BlockState>) -> bool {
        self.registry.is_see_through(state)
    }

    fn render(
        &self,
        mesh: &mut ChunkMesh,
        x: i32,
        y: i32,
        z: i32,
        blocks: &dyn BlockSource,
        state: BlockState,
    ) -> Result<bool, MeshError> {
        if !self.registry.is_valid(state) {
            return Err(MeshError::Registry(format!(
                "no renderer for {state:?} at ({x}, {y}, {z})"
            )));
        }
        let faces = VisibleFaces::compute(blocks, x, y, z, state, |s| self.is_see_through(s));
        for dir in FaceDirection::ALL {
            if faces.is_visible(dir) {
                mesh.push_face(dir, x as usize, y as usize, z as usize, state);
            }
        }
        Ok(faces.count() > 0)
    }
}
