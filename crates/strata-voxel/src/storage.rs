//! Dense 3-D block state storage addressed through a palette.
//!
//! Cells hold bit-packed palette indices at `max(4, ceil(log2(palette size)))`
//! bits each. A storage is either live or released; once
//! [`delete`](BlockStateStorage::delete) runs, the packed buffer is gone and
//! every accessor returns [`StorageError::Released`].

use std::sync::Arc;

use thiserror::Error;

use crate::bit_packed::{self, BitPackedArray};
use crate::block::BlockState;
use crate::palette::{BlockStatePalette, IndexedBlockStatePalette, PaletteError};

/// Errors from [`BlockStateStorage`] operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("position ({x}, {y}, {z}) outside storage of {width}x{height}x{depth}")]
    OutOfBounds {
        x: i32,
        y: i32,
        z: i32,
        width: usize,
        height: usize,
        depth: usize,
    },
    #[error("storage used after it was released")]
    Released,
    #[error("packed data is {actual} bytes, expected {expected}")]
    DataLength { expected: usize, actual: usize },
    #[error("cannot copy between storages of different shape or palette")]
    Incompatible,
    #[error(transparent)]
    Palette(#[from] PaletteError),
}

/// Width x height x depth grid of block states backed by packed palette indices.
#[derive(Debug)]
pub struct BlockStateStorage {
    width: usize,
    height: usize,
    depth: usize,
    palette: Arc<IndexedBlockStatePalette>,
    /// `None` once released.
    data: Option<BitPackedArray>,
}

impl BlockStateStorage {
    /// Creates a storage with every cell set to palette index 0.
    pub fn new(
        width: usize,
        height: usize,
        depth: usize,
        palette: Arc<IndexedBlockStatePalette>,
    ) -> Self {
        let bits = bit_packed::bits_for_palette_size(palette.num_keys());
        Self {
            width,
            height,
            depth,
            data: Some(BitPackedArray::new(bits, width * height * depth)),
            palette,
        }
    }

    /// Cube-shaped storage with edge length `size`.
    pub fn cube(size: usize, palette: Arc<IndexedBlockStatePalette>) -> Self {
        Self::new(size, size, size, palette)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Total number of cells.
    pub fn volume(&self) -> usize {
        self.width * self.height * self.depth
    }

    pub fn palette(&self) -> &Arc<IndexedBlockStatePalette> {
        &self.palette
    }

    /// Bits used per cell.
    pub fn bits(&self) -> u8 {
        bit_packed::bits_for_palette_size(self.palette.num_keys())
    }

    /// Reads the state at `(x, y, z)`.
    pub fn get(&self, x: i32, y: i32, z: i32) -> Result<Option<BlockState>, StorageError> {
        let index = self.get_index(x, y, z)?;
        Ok(self.palette.instance(index)?)
    }

    /// Writes `state` at `(x, y, z)`. The state must already be in the palette.
    pub fn set(
        &mut self,
        x: i32,
        y: i32,
        z: i32,
        state: Option<BlockState>,
    ) -> Result<(), StorageError> {
        let index = self.palette.index_of(state)?;
        self.set_index(x, y, z, index)
    }

    /// Raw palette index at `(x, y, z)`.
    pub fn get_index(&self, x: i32, y: i32, z: i32) -> Result<u32, StorageError> {
        let cell = self.cell(x, y, z)?;
        Ok(self.data()?.get(cell))
    }

    /// Writes a raw palette index at `(x, y, z)`.
    pub fn set_index(&mut self, x: i32, y: i32, z: i32, index: u32) -> Result<(), StorageError> {
        if index as usize >= self.palette.num_keys() {
            return Err(PaletteError::IndexOutOfRange {
                index,
                len: self.palette.num_keys(),
            }
            .into());
        }
        let cell = self.cell(x, y, z)?;
        self.data_mut()?.set(cell, index);
        Ok(())
    }

    /// The packed cell buffer exported as big-endian bytes.
    pub fn palette_data(&self) -> Result<Vec<u8>, StorageError> {
        Ok(self.data()?.to_be_bytes())
    }

    /// Byte length that [`palette_data`](Self::palette_data) produces and
    /// [`apply`](Self::apply) accepts.
    pub fn palette_data_len(&self) -> usize {
        bit_packed::byte_len(self.bits(), self.volume())
    }

    /// Overwrites every cell from bytes produced by `palette_data` on a
    /// storage of identical shape and palette size.
    ///
    /// Every decoded index is checked against the palette, so a corrupted
    /// buffer is rejected instead of producing unreadable cells.
    pub fn apply(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        if self.data.is_none() {
            return Err(StorageError::Released);
        }
        let bits = self.bits();
        let volume = self.volume();
        let data =
            BitPackedArray::from_be_bytes(bits, volume, bytes).ok_or(StorageError::DataLength {
                expected: bit_packed::byte_len(bits, volume),
                actual: bytes.len(),
            })?;
        let len = self.palette.num_keys();
        if let Some(index) = (0..volume).map(|i| data.get(i)).find(|&i| i as usize >= len) {
            return Err(PaletteError::IndexOutOfRange { index, len }.into());
        }
        self.data = Some(data);
        Ok(())
    }

    /// Copies every cell of `other` into this storage.
    ///
    /// Both storages must share shape and an equal palette.
    pub fn copy_from(&mut self, other: &BlockStateStorage) -> Result<(), StorageError> {
        let same_shape =
            self.width == other.width && self.height == other.height && self.depth == other.depth;
        let same_palette =
            Arc::ptr_eq(&self.palette, &other.palette) || self.palette == other.palette;
        if !same_shape || !same_palette {
            return Err(StorageError::Incompatible);
        }
        let source = other.data()?.clone();
        *self.data_mut()? = source;
        Ok(())
    }

    /// Releases the packed buffer. Further access fails with
    /// [`StorageError::Released`]. Releasing twice is harmless.
    pub fn delete(&mut self) {
        self.data = None;
    }

    pub fn is_deleted(&self) -> bool {
        self.data.is_none()
    }

    fn data(&self) -> Result<&BitPackedArray, StorageError> {
        self.data.as_ref().ok_or(StorageError::Released)
    }

    fn data_mut(&mut self) -> Result<&mut BitPackedArray, StorageError> {
        self.data.as_mut().ok_or(StorageError::Released)
    }

    /// Linear cell index; x varies fastest, then z, then y.
    fn cell(&self, x: i32, y: i32, z: i32) -> Result<usize, StorageError> {
        let in_range = |v: i32, bound: usize| v >= 0 && (v as usize) < bound;
        if !(in_range(x, self.width) && in_range(y, self.height) && in_range(z, self.depth)) {
            return Err(StorageError::OutOfBounds {
                x,
                y,
                z,
                width: self.width,
                height: self.height,
                depth: self.depth,
            });
        }
        Ok((y as usize * self.depth + z as usize) * self.width + x as usize)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
