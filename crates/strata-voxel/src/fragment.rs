//! Chunk fragmenting: the wire form of a chunk's blocks.
//!
//! A chunk is cut into 16x16x16 fragments. Fragments holding only air are
//! left out and a presence bitset records which ones were written. Each
//! written fragment carries its own small palette, expressed as indices into
//! the global palette, and its cells packed against that local palette.
//!
//! ## Fragment layout
//!
//! All integers are big-endian `i32`.
//!
//! | Size | Field |
//! |------|-------|
//! | 4 | Remap bit width `B` |
//! | 4 | Local palette size `N` |
//! | 4 | Remap byte length `R` |
//! | R | `N` global indices packed at `B` bits (big-endian `u64` words) |
//! | 4 | Cell data byte length `L` |
//! | L | 4096 local indices packed at `max(4, ceil(log2 N))` bits |
//!
//! Fragment `(fx, fy, fz)` has bitset index `fz * xc * yc + fy * xc + fx`,
//! and written fragments appear in the payload in x-major, then z, then y
//! order. Encoding runs fragments in parallel; the payload is joined in that
//! fixed order regardless of completion order.

use std::sync::{Arc, Mutex, PoisonError};

use bitvec::prelude::*;
use rayon::prelude::*;
use thiserror::Error;

use crate::bit_packed::{self, BitPackedArray, MAX_BITS};
use crate::block::BlockState;
use crate::chunk::{CHUNK_SIZE, Chunk, ChunkBlocks, ChunkError, ChunkPos, SECTION_VOLUME, column_index};
use crate::palette::{BlockStatePalette, IndexedBlockStatePalette, PaletteError};
use crate::storage::{BlockStateStorage, StorageError};

/// Edge length of one fragment in blocks.
pub const FRAGMENT_SIZE: i32 = 16;

/// Errors from fragmenting or reassembling a chunk.
#[derive(Debug, Error)]
pub enum FragmentError {
    #[error("fragment data truncated: needed {needed} bytes at offset {offset}, {remaining} left")]
    Truncated {
        offset: usize,
        needed: usize,
        remaining: usize,
    },
    #[error("{0} unread bytes after the last fragment")]
    TrailingBytes(usize),
    #[error("presence bitset has {actual} bits, expected {expected}")]
    PresenceLength { expected: usize, actual: usize },
    #[error("invalid remap bit width {0}")]
    InvalidBitWidth(i32),
    #[error("invalid local palette size {0}")]
    InvalidPaletteSize(i32),
    #[error("{field} is {actual} bytes, expected {expected}")]
    LengthMismatch {
        field: &'static str,
        expected: usize,
        actual: i64,
    },
    #[error(transparent)]
    Palette(#[from] PaletteError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
}

/// Fragment counts along each axis for a column of a given height.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FragmentGrid {
    pub x_count: usize,
    pub y_count: usize,
    pub z_count: usize,
}

impl FragmentGrid {
    pub fn for_height(height: i32) -> Self {
        Self {
            x_count: (CHUNK_SIZE / FRAGMENT_SIZE) as usize,
            y_count: (height / FRAGMENT_SIZE) as usize,
            z_count: (CHUNK_SIZE / FRAGMENT_SIZE) as usize,
        }
    }

    /// Total number of fragments, which is also the bitset length.
    pub fn len(&self) -> usize {
        self.x_count * self.y_count * self.z_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bitset index of fragment `[fx, fy, fz]`.
    pub fn index(&self, [fx, fy, fz]: [usize; 3]) -> usize {
        fz * self.x_count * self.y_count + fy * self.x_count + fx
    }

    /// Fragments in payload order: x outermost, then z, then y.
    pub fn order(&self) -> Vec<[usize; 3]> {
        let mut order = Vec::with_capacity(self.len());
        for fx in 0..self.x_count {
            for fz in 0..self.z_count {
                for fy in 0..self.y_count {
                    order.push([fx, fy, fz]);
                }
            }
        }
        order
    }
}

/// A chunk in wire form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FragmentedChunk {
    /// Bit `i` set when fragment `i` is in the payload.
    pub presence: BitVec<u64, Lsb0>,
    /// Written fragments back to back.
    pub payload: Vec<u8>,
}

/// Converts chunk cells to and from [`FragmentedChunk`] against a global palette.
#[derive(Clone, Debug)]
pub struct ChunkFragmenter {
    global: Arc<IndexedBlockStatePalette>,
}

impl ChunkFragmenter {
    pub fn new(global: Arc<IndexedBlockStatePalette>) -> Self {
        Self { global }
    }

    pub fn global_palette(&self) -> &Arc<IndexedBlockStatePalette> {
        &self.global
    }

    pub fn fragment_chunk(&self, chunk: &Chunk) -> Result<FragmentedChunk, FragmentError> {
        self.fragment_cells(chunk.blocks(), chunk.height())
    }

    pub fn fragment(&self, blocks: &ChunkBlocks) -> Result<FragmentedChunk, FragmentError> {
        self.fragment_cells(blocks.blocks(), blocks.height())
    }

    fn fragment_cells(
        &self,
        cells: &[Option<BlockState>],
        height: i32,
    ) -> Result<FragmentedChunk, FragmentError> {
        let grid = FragmentGrid::for_height(height);
        let presence = Mutex::new(bitvec![u64, Lsb0; 0; grid.len()]);

        let parts = grid
            .order()
            .par_iter()
            .map(|&frag| {
                let encoded = self.encode_fragment(cells, height, frag)?;
                if encoded.is_some() {
                    presence
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .set(grid.index(frag), true);
                }
                Ok(encoded)
            })
            .collect::<Result<Vec<Option<Vec<u8>>>, FragmentError>>()?;

        Ok(FragmentedChunk {
            presence: presence.into_inner().unwrap_or_else(PoisonError::into_inner),
            payload: parts.into_iter().flatten().flatten().collect(),
        })
    }

    /// Encodes one fragment, or returns `None` if it is all air.
    fn encode_fragment(
        &self,
        cells: &[Option<BlockState>],
        height: i32,
        [fx, fy, fz]: [usize; 3],
    ) -> Result<Option<Vec<u8>>, FragmentError> {
        let base = [fx as i32 * FRAGMENT_SIZE, fy as i32 * FRAGMENT_SIZE, fz as i32 * FRAGMENT_SIZE];
        let cell = |[x, y, z]: [i32; 3]| {
            cells[column_index(height, base[0] + x, base[1] + y, base[2] + z)]
        };

        if fragment_positions().all(|p| cell(p).is_none()) {
            return Ok(None);
        }

        let local = Arc::new(IndexedBlockStatePalette::with_air(
            fragment_positions().map(cell),
        ));
        let mut storage = BlockStateStorage::cube(FRAGMENT_SIZE as usize, Arc::clone(&local));
        for pos @ [x, y, z] in fragment_positions() {
            let state = cell(pos);
            if state.is_some() {
                storage.set(x, y, z, state)?;
            }
        }

        let remap = local.instance_indices(self.global.as_ref())?;
        let bits = bit_packed::bits_for_max_value(remap.iter().copied().max().unwrap_or(0));
        let mut packed = BitPackedArray::new(bits, remap.len());
        for (i, &global_index) in remap.iter().enumerate() {
            packed.set(i, global_index);
        }
        let remap_bytes = packed.to_be_bytes();
        let cell_bytes = storage.palette_data()?;
        storage.delete();

        let mut out = Vec::with_capacity(16 + remap_bytes.len() + cell_bytes.len());
        out.extend_from_slice(&i32::from(bits).to_be_bytes());
        out.extend_from_slice(&(remap.len() as i32).to_be_bytes());
        out.extend_from_slice(&(remap_bytes.len() as i32).to_be_bytes());
        out.extend_from_slice(&remap_bytes);
        out.extend_from_slice(&(cell_bytes.len() as i32).to_be_bytes());
        out.extend_from_slice(&cell_bytes);
        Ok(Some(out))
    }

    /// Rebuilds a chunk's cells from wire form.
    ///
    /// Absent fragments are air. Any inconsistency between the presence
    /// bitset, the payload and the global palette is an error; nothing is
    /// partially returned.
    pub fn defragment(
        &self,
        origin: ChunkPos,
        height: i32,
        fragmented: &FragmentedChunk,
    ) -> Result<ChunkBlocks, FragmentError> {
        let mut blocks = ChunkBlocks::new(origin, height)?;
        let grid = FragmentGrid::for_height(height);
        if fragmented.presence.len() != grid.len() {
            return Err(FragmentError::PresenceLength {
                expected: grid.len(),
                actual: fragmented.presence.len(),
            });
        }

        let mut reader = ByteReader::new(&fragmented.payload);
        for frag in grid.order() {
            if !fragmented.presence[grid.index(frag)] {
                continue;
            }
            self.decode_fragment(&mut reader, &mut blocks, frag)?;
        }
        if reader.remaining() > 0 {
            return Err(FragmentError::TrailingBytes(reader.remaining()));
        }
        Ok(blocks)
    }

    /// Writes decoded cells into a chunk that has not been loaded yet.
    pub fn defragment_into(
        &self,
        chunk: &mut Chunk,
        fragmented: &FragmentedChunk,
    ) -> Result<(), FragmentError> {
        let origin = chunk.origin();
        let blocks = self.defragment(origin, chunk.height(), fragmented)?;
        for x in 0..CHUNK_SIZE {
            for y in 0..chunk.height() {
                for z in 0..CHUNK_SIZE {
                    chunk.set_block_untracked(
                        origin.x() + x,
                        y,
                        origin.z() + z,
                        blocks.get(x, y, z),
                    )?;
                }
            }
        }
        Ok(())
    }

    fn decode_fragment(
        &self,
        reader: &mut ByteReader<'_>,
        blocks: &mut ChunkBlocks,
        [fx, fy, fz]: [usize; 3],
    ) -> Result<(), FragmentError> {
        let bits = reader.read_i32()?;
        if !(1..=i32::from(MAX_BITS)).contains(&bits) {
            return Err(FragmentError::InvalidBitWidth(bits));
        }
        let count = reader.read_i32()?;
        if !(1..=SECTION_VOLUME as i32 + 1).contains(&count) {
            return Err(FragmentError::InvalidPaletteSize(count));
        }
        let (bits, count) = (bits as u8, count as usize);

        let remap_len = reader.read_i32()?;
        let expected = bit_packed::byte_len(bits, count);
        if remap_len as i64 != expected as i64 {
            return Err(FragmentError::LengthMismatch {
                field: "remap",
                expected,
                actual: i64::from(remap_len),
            });
        }
        let remap = BitPackedArray::from_be_bytes(bits, count, reader.read_bytes(expected)?)
            .ok_or(FragmentError::LengthMismatch {
                field: "remap",
                expected,
                actual: i64::from(remap_len),
            })?;

        let states = (0..count)
            .map(|i| self.global.instance(remap.get(i)))
            .collect::<Result<Vec<_>, _>>()?;
        let local = Arc::new(IndexedBlockStatePalette::from_exact(states)?);

        let mut storage = BlockStateStorage::cube(FRAGMENT_SIZE as usize, local);
        let cell_len = reader.read_i32()?;
        let expected = storage.palette_data_len();
        if cell_len as i64 != expected as i64 {
            return Err(FragmentError::LengthMismatch {
                field: "cell data",
                expected,
                actual: i64::from(cell_len),
            });
        }
        storage.apply(reader.read_bytes(expected)?)?;

        let base = [fx as i32 * FRAGMENT_SIZE, fy as i32 * FRAGMENT_SIZE, fz as i32 * FRAGMENT_SIZE];
        for [x, y, z] in fragment_positions() {
            blocks.set(base[0] + x, base[1] + y, base[2] + z, storage.get(x, y, z)?);
        }
        storage.delete();
        Ok(())
    }
}

/// Every local position inside one fragment.
fn fragment_positions() -> impl Iterator<Item = [i32; 3]> {
    (0..FRAGMENT_SIZE).flat_map(|x| {
        (0..FRAGMENT_SIZE).flat_map(move |y| (0..FRAGMENT_SIZE).map(move |z| [x, y, z]))
    })
}

// ---------------------------------------------------------------------------
// Presence bitset wire form
// ---------------------------------------------------------------------------

/// Bitset as big-endian `u64` words, bit 0 in the low bit of the first word.
pub fn presence_to_bytes(bits: &BitSlice<u64, Lsb0>) -> Vec<u8> {
    let mut words = vec![0u64; bits.len().div_ceil(64)];
    for index in bits.iter_ones() {
        words[index / 64] |= 1 << (index % 64);
    }
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

/// Inverse of [`presence_to_bytes`] for a bitset of `len` bits.
pub fn presence_from_bytes(bytes: &[u8], len: usize) -> Result<BitVec<u64, Lsb0>, FragmentError> {
    let expected = len.div_ceil(64) * 8;
    if bytes.len() != expected {
        return Err(FragmentError::LengthMismatch {
            field: "presence",
            expected,
            actual: bytes.len() as i64,
        });
    }
    let mut bits = bitvec![u64, Lsb0; 0; len];
    for (w, chunk) in bytes.chunks_exact(8).enumerate() {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(chunk);
        let word = u64::from_be_bytes(raw);
        for b in 0..64 {
            let index = w * 64 + b;
            if word & (1 << b) != 0 {
                if index >= len {
                    return Err(FragmentError::PresenceLength {
                        expected: len,
                        actual: index + 1,
                    });
                }
                bits.set(index, true);
            }
        }
    }
    Ok(bits)
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

struct ByteReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], FragmentError> {
        if self.remaining() < n {
            return Err(FragmentError::Truncated {
                offset: self.offset,
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    fn read_i32(&mut self) -> Result<i32, FragmentError> {
        let bytes = self.read_bytes(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockId;
    use crate::registry::{BlockDef, BlockRegistry};

    fn registry() -> BlockRegistry {
        BlockRegistry::from_defs([
            BlockDef::opaque("stone"),
            BlockDef::opaque("dirt"),
            BlockDef::opaque("log").with_variants(4),
        ])
        .unwrap()
    }

    fn fragmenter() -> ChunkFragmenter {
        ChunkFragmenter::new(Arc::new(registry().global_palette()))
    }

    fn origin() -> ChunkPos {
        ChunkPos::from_chunk_coords(2, -3)
    }

    fn s(id: u16, variant: u8) -> Option<BlockState> {
        Some(BlockState::new(BlockId(id), variant))
    }

    #[test]
    fn test_grid_index_and_order() {
        let grid = FragmentGrid::for_height(128);
        assert_eq!(grid.len(), 8);
        assert_eq!(grid.index([0, 5, 0]), 5);
        assert_eq!(grid.order()[3], [0, 3, 0]);
    }

    #[test]
    fn test_all_air_chunk_is_empty() {
        let blocks = ChunkBlocks::new(origin(), 64).unwrap();
        let fragmented = fragmenter().fragment(&blocks).unwrap();
        assert_eq!(fragmented.presence.len(), 4);
        assert!(fragmented.presence.not_any());
        assert!(fragmented.payload.is_empty());
    }

    #[test]
    fn test_single_full_fragment() {
        let mut blocks = ChunkBlocks::new(origin(), 128).unwrap();
        for y in 80..96 {
            blocks.fill_layer(y, s(2, 3));
        }
        let fragmented = fragmenter().fragment(&blocks).unwrap();
        assert_eq!(fragmented.presence.iter_ones().collect::<Vec<_>>(), vec![5]);

        let payload = &fragmented.payload;
        let bits = i32::from_be_bytes(payload[0..4].try_into().unwrap());
        let count = i32::from_be_bytes(payload[4..8].try_into().unwrap());
        let remap_len = i32::from_be_bytes(payload[8..12].try_into().unwrap()) as usize;
        assert_eq!(bits, 4);
        // Air plus the one state present.
        assert_eq!(count, 2);
        assert_eq!(remap_len, 8);
        let cell_len_at = 12 + remap_len;
        let cell_len =
            i32::from_be_bytes(payload[cell_len_at..cell_len_at + 4].try_into().unwrap()) as usize;
        assert_eq!(cell_len, 2048);
        assert_eq!(payload.len(), cell_len_at + 4 + cell_len);

        let restored = fragmenter().defragment(origin(), 128, &fragmented).unwrap();
        assert_eq!(restored, blocks);
    }

    #[test]
    fn test_single_fragment_in_tall_chunk() {
        let mut blocks = ChunkBlocks::new(origin(), 256).unwrap();
        for y in 80..96 {
            blocks.fill_layer(y, s(2, 3));
        }
        let fragmented = fragmenter().fragment(&blocks).unwrap();
        assert_eq!(fragmented.presence.len(), 16);
        assert_eq!(fragmented.presence.count_ones(), 1);
        assert!(fragmented.presence[5]);

        let restored = fragmenter().defragment(origin(), 256, &fragmented).unwrap();
        assert_eq!(restored, blocks);
    }

    #[test]
    fn test_roundtrip_mixed_states() {
        let mut blocks = ChunkBlocks::new(origin(), 64).unwrap();
        for x in 0..16 {
            for z in 0..16 {
                blocks.set(x, (x + z) % 64, z, s((x % 3) as u16, 0));
                blocks.set(x, 40, z, s(2, (z % 4) as u8));
            }
        }
        let fragmented = fragmenter().fragment(&blocks).unwrap();
        assert_eq!(fragmented.presence.count_ones(), 3);
        let restored = fragmenter().defragment(origin(), 64, &fragmented).unwrap();
        assert_eq!(restored, blocks);
    }

    #[test]
    fn test_payload_order_is_deterministic() {
        let mut blocks = ChunkBlocks::new(origin(), 256).unwrap();
        for y in (0..256).step_by(7) {
            blocks.set(3, y, 3, s(0, 0));
        }
        let a = fragmenter().fragment(&blocks).unwrap();
        let b = fragmenter().fragment(&blocks).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_unknown_state_fails_to_fragment() {
        let mut blocks = ChunkBlocks::new(origin(), 16).unwrap();
        blocks.set(0, 0, 0, s(40, 0));
        assert!(matches!(
            fragmenter().fragment(&blocks),
            Err(FragmentError::Palette(PaletteError::UnknownState(_)))
        ));
    }

    #[test]
    fn test_truncated_payload() {
        let mut blocks = ChunkBlocks::new(origin(), 32).unwrap();
        blocks.set(1, 1, 1, s(0, 0));
        let mut fragmented = fragmenter().fragment(&blocks).unwrap();
        fragmented.payload.truncate(fragmented.payload.len() - 1);
        assert!(matches!(
            fragmenter().defragment(origin(), 32, &fragmented),
            Err(FragmentError::Truncated { .. })
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut blocks = ChunkBlocks::new(origin(), 32).unwrap();
        blocks.set(1, 1, 1, s(0, 0));
        let mut fragmented = fragmenter().fragment(&blocks).unwrap();
        fragmented.payload.push(0);
        assert!(matches!(
            fragmenter().defragment(origin(), 32, &fragmented),
            Err(FragmentError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_presence_without_payload() {
        let blocks = ChunkBlocks::new(origin(), 32).unwrap();
        let mut fragmented = fragmenter().fragment(&blocks).unwrap();
        fragmented.presence.set(1, true);
        assert!(matches!(
            fragmenter().defragment(origin(), 32, &fragmented),
            Err(FragmentError::Truncated { offset: 0, .. })
        ));
    }

    #[test]
    fn test_wrong_presence_length() {
        let blocks = ChunkBlocks::new(origin(), 32).unwrap();
        let fragmented = fragmenter().fragment(&blocks).unwrap();
        assert!(matches!(
            fragmenter().defragment(origin(), 64, &fragmented),
            Err(FragmentError::PresenceLength { expected: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_global_index_out_of_range() {
        let mut blocks = ChunkBlocks::new(origin(), 16).unwrap();
        blocks.set(0, 0, 0, s(0, 0));
        let mut fragmented = fragmenter().fragment(&blocks).unwrap();
        // Remap word holds [air=0, stone=1]; point entry 1 past the palette.
        let word_end = 12 + 8;
        fragmented.payload[word_end - 1] = 0xF0;
        assert!(matches!(
            fragmenter().defragment(origin(), 16, &fragmented),
            Err(FragmentError::Palette(PaletteError::IndexOutOfRange { index: 15, .. }))
        ));
    }

    #[test]
    fn test_smaller_global_palette_rejects_bad_index() {
        let mut blocks = ChunkBlocks::new(origin(), 16).unwrap();
        blocks.set(0, 0, 0, s(2, 3));
        let fragmented = fragmenter().fragment(&blocks).unwrap();
        let tiny = ChunkFragmenter::new(Arc::new(
            BlockRegistry::from_defs([BlockDef::opaque("stone")])
                .unwrap()
                .global_palette(),
        ));
        assert_eq!(tiny.global_palette().num_keys(), 2);
        assert!(tiny.defragment(origin(), 16, &fragmented).is_err());
    }

    #[test]
    fn test_defragment_into_unloaded_chunk() {
        let changer = crate::changer::WorldBlockChanger::new();
        let mut source = Chunk::new(origin(), 32, changer.sender()).unwrap();
        source
            .set_block_untracked(origin().x() + 4, 20, origin().z() + 9, s(1, 0))
            .unwrap();
        let fragmented = fragmenter().fragment_chunk(&source).unwrap();

        let mut target = Chunk::new(origin(), 32, changer.sender()).unwrap();
        fragmenter().defragment_into(&mut target, &fragmented).unwrap();
        assert_eq!(target.blocks(), source.blocks());
    }

    #[test]
    fn test_presence_bytes_roundtrip() {
        let mut bits = bitvec![u64, Lsb0; 0; 70];
        bits.set(0, true);
        bits.set(65, true);
        let bytes = presence_to_bytes(&bits);
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[7], 0x01);
        assert_eq!(presence_from_bytes(&bytes, 70).unwrap(), bits);
        assert!(presence_from_bytes(&bytes, 64).is_err());
    }
}
