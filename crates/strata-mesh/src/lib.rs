//! Section meshing: face culling against snapshot copies of a section and its
//! neighbours, and the worker pipeline that rebuilds section meshes off the
//! world thread.

pub mod chunk_mesh;
pub mod error;
pub mod face_direction;
pub mod meshing;
pub mod rebuilder;
pub mod render;
pub mod snapshot;
pub mod visible_faces;

pub use chunk_mesh::{ChunkMesh, MeshVertex};
pub use error::MeshError;
pub use face_direction::FaceDirection;
pub use meshing::build_section_mesh;
pub use rebuilder::{
    ChunkMeshRebuilder, FinishedMesh, MeshInstaller, MeshRebuildListener, MeshTask, MeshTaskState,
    RebuildStats,
};
pub use render::{CubeRenderer, MeshableRegistry};
pub use snapshot::SectionSnapshot;
pub use visible_faces::VisibleFaces;
