//! The storage half of a bit vector: a logical length in bits and a pointer
//! to whole 64-bit words. Growing, shrinking and freeing the words is the job
//! of [`MemoryManager::resize()`] and [`MemoryManager::clear()`]; a vector
//! never reallocates itself.
//!
//! Storage is always one word longer than needed when the length is a
//! multiple of 64, so `rank(len())` can read `words()[len() / 64]`.
//!
//! [`MemoryManager::resize()`]: super::manager::MemoryManager::resize
//! [`MemoryManager::clear()`]: super::manager::MemoryManager::clear

use std::{fmt, ptr::NonNull, slice};

use crate::util::num::padded_bytes;

/// What [`MemoryManager`](super::manager::MemoryManager) needs to see of a
/// vector to manage its storage.
///
/// # Safety
///
/// - The getters must return exactly what was last passed to the setters
///   (both start out as `0` and `None`).
/// - Nothing but `MemoryManager` may call the setters, and it guarantees that
///   whenever `data()` is `Some`, it points to at least
///   `padded_bytes(bit_len())` bytes allocated through it.
pub unsafe trait BitStorage {
    fn bit_len(&self) -> u64;

    fn data(&self) -> Option<NonNull<u64>>;

    /// # Safety
    ///
    /// See the trait documentation.
    unsafe fn set_bit_len(&mut self, len: u64);

    /// # Safety
    ///
    /// See the trait documentation.
    unsafe fn set_data(&mut self, data: Option<NonNull<u64>>);
}

/// A plain bit vector whose words come from a
/// [`MemoryManager`](super::manager::MemoryManager).
///
/// There is no RAII here: the words must be given back with
/// `MemoryManager::clear()`, or they leak.
#[derive(Default)]
pub struct RawBitVec {
    len: u64,
    data: Option<NonNull<u64>>,
}

// SAFETY: `RawBitVec` uniquely owns its words.
unsafe impl Send for RawBitVec {}

impl RawBitVec {
    pub const fn new() -> Self {
        Self { len: 0, data: None }
    }

    /// Logical length in bits
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Length rounded up to whole words, in bits.
    pub fn capacity(&self) -> u64 {
        ((self.len + 63) >> 6) << 6
    }

    /// All backing words, including the padding word if there is one.
    pub fn words(&self) -> &[u64] {
        match self.data {
            // SAFETY: `BitStorage` contract, the manager allocated at least
            // this many words.
            Some(data) => unsafe { slice::from_raw_parts(data.as_ptr(), self.word_count()) },
            None => &[],
        }
    }

    pub fn words_mut(&mut self) -> &mut [u64] {
        match self.data {
            // SAFETY: as above, and `&mut self` makes the borrow unique.
            Some(data) => unsafe { slice::from_raw_parts_mut(data.as_ptr(), self.word_count()) },
            None => &mut [],
        }
    }

    fn word_count(&self) -> usize {
        padded_bytes(self.len).map_or(0, |bytes| (bytes / 8) as usize)
    }

    /// # Panics
    /// - If `index >= len()`
    pub fn get(&self, index: u64) -> bool {
        assert!(index < self.len, "bit {index} out of bounds ({})", self.len);
        self.words()[(index >> 6) as usize] >> (index & 63) & 1 == 1
    }

    /// # Panics
    /// - If `index >= len()`
    pub fn set(&mut self, index: u64, bit: bool) {
        assert!(index < self.len, "bit {index} out of bounds ({})", self.len);
        let word = &mut self.words_mut()[(index >> 6) as usize];
        let mask = 1u64 << (index & 63);
        if bit {
            *word |= mask;
        } else {
            *word &= !mask;
        }
    }

    /// Number of set bits in `[0, index)`. `index == len()` is allowed and
    /// reads the padding word when `len()` is a multiple of 64.
    ///
    /// # Panics
    /// - If `index > len()`
    pub fn rank(&self, index: u64) -> u64 {
        assert!(index <= self.len, "rank {index} out of bounds ({})", self.len);
        let words = self.words();
        if words.is_empty() {
            return 0;
        }
        let full = (index >> 6) as usize;
        let whole: u64 = words[..full].iter().map(|w| w.count_ones() as u64).sum();
        let mask = (1u64 << (index & 63)) - 1;
        whole + (words[full] & mask).count_ones() as u64
    }
}

// SAFETY: `RawBitVec` stores exactly what it is given.
unsafe impl BitStorage for RawBitVec {
    fn bit_len(&self) -> u64 {
        self.len
    }

    fn data(&self) -> Option<NonNull<u64>> {
        self.data
    }

    unsafe fn set_bit_len(&mut self, len: u64) {
        self.len = len;
    }

    unsafe fn set_data(&mut self, data: Option<NonNull<u64>>) {
        self.data = data;
    }
}

impl fmt::Debug for RawBitVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawBitVec")
            .field("len", &self.len)
            .field("data", &self.data)
            .finish()
    }
}
