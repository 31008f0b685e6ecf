//! Vertex and index buffers produced by section meshing.
//!
//! Every block face becomes one unit square: four vertices and two triangles.
//! Vertices are section-local, so a consumer offsets them by the section
//! origin before upload.

use strata_voxel::BlockState;

use crate::face_direction::FaceDirection;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeshVertex {
    /// Section-local position, each axis in `0.0..=16.0`.
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
    /// Looked up by the renderer for the face texture.
    pub state: BlockState,
}

/// Corner offsets of a unit square in the face plane, walked counter-clockwise.
const CORNERS: [[f32; 2]; 4] = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];

const FRONT: [u32; 6] = [0, 1, 2, 0, 2, 3];
const BACK: [u32; 6] = [0, 2, 1, 0, 3, 2];

#[derive(Clone, Debug, Default)]
pub struct ChunkMesh {
    pub vertices: Vec<MeshVertex>,
    /// Triangle list into `vertices`.
    pub indices: Vec<u32>,
    /// Direction of each emitted face, in emission order.
    pub faces: Vec<FaceDirection>,
}

impl ChunkMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emits the `direction` face of the block at section-local `(x, y, z)`.
    pub fn push_face(
        &mut self,
        direction: FaceDirection,
        x: usize,
        y: usize,
        z: usize,
        state: BlockState,
    ) {
        let (normal_axis, u_axis, v_axis) = direction.sweep_axes();
        let block = [x as f32, y as f32, z as f32];
        let outward = is_positive(direction);

        let mut plane = block;
        if outward {
            plane[normal_axis] += 1.0;
        }

        let base = u32::try_from(self.vertices.len()).unwrap_or(u32::MAX);
        self.vertices.extend(CORNERS.iter().map(|&[du, dv]| {
            let mut position = plane;
            position[u_axis] += du;
            position[v_axis] += dv;
            MeshVertex {
                position,
                normal: direction.normal(),
                uv: [du, dv],
                state,
            }
        }));

        let winding = if outward { FRONT } else { BACK };
        self.indices.extend(winding.iter().map(|i| base + i));
        self.faces.push(direction);
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    /// Number of emitted faces pointing along `direction`.
    pub fn faces_facing(&self, direction: FaceDirection) -> usize {
        self.faces.iter().filter(|&&d| d == direction).count()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }
}

fn is_positive(direction: FaceDirection) -> bool {
    matches!(
        direction,
        FaceDirection::PosX | FaceDirection::PosY | FaceDirection::PosZ
    )
}
