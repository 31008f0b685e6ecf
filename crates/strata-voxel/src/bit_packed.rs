//! Bit-packed array for storing fixed-width integer values in a compact `Vec<u64>`.
//!
//! Each element occupies exactly `bits` bits (1 to 32). Elements never straddle
//! a word boundary: a word holds `64 / bits` elements and any leftover high bits
//! stay zero. The exported byte form is the word array in big-endian order.

/// Smallest element width used for palette indices.
pub const MIN_PALETTE_BITS: u8 = 4;

/// Largest supported element width.
pub const MAX_BITS: u8 = 32;

/// A compact array where each element is stored using a fixed number of bits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BitPackedArray {
    /// Raw storage. Elements are packed into 64-bit words.
    data: Vec<u64>,
    /// Bits per element.
    bits: u8,
    /// Total number of logical elements.
    len: usize,
}

impl BitPackedArray {
    /// Creates a new array with `len` elements, all initialized to zero.
    ///
    /// `bits` must be in `1..=32`.
    pub fn new(bits: u8, len: usize) -> Self {
        debug_assert!(
            (1..=MAX_BITS).contains(&bits),
            "bits must be in 1..={MAX_BITS}, got {bits}"
        );
        Self {
            data: vec![0u64; word_count(bits, len)],
            bits,
            len,
        }
    }

    /// Returns the value at the given index.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len` in debug builds.
    pub fn get(&self, index: usize) -> u32 {
        debug_assert!(index < self.len, "index {index} out of bounds ({})", self.len);
        let (word, offset) = self.locate(index);
        ((self.data[word] >> offset) & self.mask()) as u32
    }

    /// Sets the value at the given index.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len` in debug builds, or if `value` exceeds
    /// the maximum for the current bit width.
    pub fn set(&mut self, index: usize, value: u32) {
        debug_assert!(index < self.len, "index {index} out of bounds ({})", self.len);
        debug_assert!(
            u64::from(value) <= self.mask(),
            "value {value} exceeds {}-bit capacity",
            self.bits
        );
        let (word, offset) = self.locate(index);
        let mask = self.mask();
        self.data[word] &= !(mask << offset);
        self.data[word] |= (u64::from(value) & mask) << offset;
    }

    /// Returns the number of bits per element.
    pub fn bits(&self) -> u8 {
        self.bits
    }

    /// Returns the number of logical elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the array has no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the size of the backing storage in bytes.
    pub fn storage_bytes(&self) -> usize {
        self.data.len() * 8
    }

    /// Returns a reference to the raw `u64` storage words.
    pub fn raw_data(&self) -> &[u64] {
        &self.data
    }

    /// Exports the words as big-endian bytes.
    pub fn to_be_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.storage_bytes());
        for word in &self.data {
            out.extend_from_slice(&word.to_be_bytes());
        }
        out
    }

    /// Rebuilds an array from bytes produced by [`to_be_bytes`](Self::to_be_bytes).
    ///
    /// Returns `None` when `bytes` is not exactly [`byte_len`] long for the
    /// given shape.
    pub fn from_be_bytes(bits: u8, len: usize, bytes: &[u8]) -> Option<Self> {
        if !(1..=MAX_BITS).contains(&bits) || bytes.len() != byte_len(bits, len) {
            return None;
        }
        let data = bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut word = [0u8; 8];
                word.copy_from_slice(chunk);
                u64::from_be_bytes(word)
            })
            .collect();
        Some(Self { data, bits, len })
    }

    fn locate(&self, index: usize) -> (usize, u32) {
        let per_word = elements_per_word(self.bits);
        let word = index / per_word;
        let offset = ((index % per_word) * self.bits as usize) as u32;
        (word, offset)
    }

    fn mask(&self) -> u64 {
        (1u64 << self.bits) - 1
    }
}

fn elements_per_word(bits: u8) -> usize {
    64 / bits as usize
}

fn word_count(bits: u8, len: usize) -> usize {
    len.div_ceil(elements_per_word(bits))
}

/// Byte length of the exported form of an array with the given shape.
pub fn byte_len(bits: u8, len: usize) -> usize {
    word_count(bits, len) * 8
}

/// Element width for a palette holding `size` entries: `max(4, ceil(log2(size)))`.
pub fn bits_for_palette_size(size: usize) -> u8 {
    let needed = if size <= 1 {
        0
    } else {
        (usize::BITS - (size - 1).leading_zeros()) as u8
    };
    needed.max(MIN_PALETTE_BITS)
}

/// Element width able to hold `max_value`, never below [`MIN_PALETTE_BITS`].
pub fn bits_for_max_value(max_value: u32) -> u8 {
    ((u32::BITS - max_value.leading_zeros()) as u8).max(MIN_PALETTE_BITS)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
