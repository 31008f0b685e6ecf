//! Chunked voxel world storage: palettes and bit-packed cell storage, chunks
//! and their sections, chunk loading and creation, queued block edits, and
//! the fragment format used to ship chunks over the wire.

pub mod bit_packed;
pub mod block;
pub mod changer;
pub mod chunk;
pub mod chunk_loading;
pub mod creator;
pub mod entity;
pub mod events;
pub mod fragment;
pub mod handler;
pub mod invalidation;
pub mod palette;
pub mod registry;
pub mod storage;
pub mod world;

pub use bit_packed::BitPackedArray;
pub use block::{BlockId, BlockPos, BlockSource, BlockState};
pub use changer::{AppliedChanges, BlockChange, BlockChangeSender, WorldBlockChanger};
pub use chunk::{
    CHUNK_SIZE, Chunk, ChunkBlocks, ChunkError, ChunkPos, ChunkSection, Direction, SECTION_HEIGHT,
    SECTION_VOLUME, SectionKey, WORLD_BORDER, within_world_border,
};
pub use chunk_loading::{ChunkLoadConfig, ChunkLoadTickResult, ChunkLoader, ViewerId};
pub use creator::{ChunkCreationListener, ChunkCreator, ChunkSource, ChunkSourceError, FlatGenerator};
pub use entity::{Entity, TrackedEntity};
pub use events::{WorldListener, WorldListeners};
pub use fragment::{ChunkFragmenter, FRAGMENT_SIZE, FragmentError, FragmentGrid, FragmentedChunk};
pub use handler::{EntityTickReport, UnloadOutcome, WorldChunkHandler};
pub use invalidation::SectionInvalidator;
pub use palette::{BlockStatePalette, IndexedBlockStatePalette, PaletteError};
pub use registry::{BlockDef, BlockRegistry, RegistryError, Transparency};
pub use storage::{BlockStateStorage, StorageError};
pub use world::{PauseTicket, TickReport, World, WorldError, WorldSettings, WorldThread};
