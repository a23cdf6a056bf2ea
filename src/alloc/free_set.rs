use std::collections::BTreeSet;

use super::block::BlockId;

/// Free blocks ordered by `(size, offset)`. Asking for the first entry at or
/// above `(size, 0)` gives the best fit, lowest address first among equals.
#[derive(Debug, Default)]
pub(crate) struct FreeSet {
    entries: BTreeSet<(usize, usize, BlockId)>,
    bytes: usize,
}

impl FreeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, size: usize, offset: usize, id: BlockId) {
        let inserted = self.entries.insert((size, offset, id));
        debug_assert!(inserted, "block at {offset} is already free");
        self.bytes += size;
    }

    /// Remove an exact entry. Panics in debug builds if it is not there, since
    /// that means the block list and this set have drifted apart.
    pub fn remove(&mut self, size: usize, offset: usize, id: BlockId) {
        let removed = self.entries.remove(&(size, offset, id));
        debug_assert!(removed, "block at {offset} is not in the free set");
        if removed {
            self.bytes -= size;
        }
    }

    /// Smallest free block with a payload of at least `size` bytes.
    pub fn best_fit(&self, size: usize) -> Option<BlockId> {
        self.entries
            .range((size, 0, BlockId::MIN)..)
            .next()
            .map(|&(_, _, id)| id)
    }

    pub fn contains(&self, size: usize, offset: usize, id: BlockId) -> bool {
        self.entries.contains(&(size, offset, id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Total free payload bytes
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}
