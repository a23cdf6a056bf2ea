//! The address-ordered list of blocks covering the arena.
//!
//! Blocks do not live inside the arena. Each one is a slot in a slab and is
//! named by a [`BlockId`]; neighbours are found through `prev`/`next` handles
//! and a block is found from a user pointer through its offset. The arena
//! bytes are only ever payload.
//!
//! ```plaintext
//!  base                                                  top       reserved
//!   |                                                     |             |
//!   +----------+---------------+------+-------------------+- - - - - - -+
//!   | alloc 32 | free 96       | 40   | alloc 128         |  (unused)   |
//!   +----------+---------------+------+-------------------+- - - - - - -+
//!   head ----> next ---------> next -> next = tail
//! ```

use hashbrown::HashMap;

/// Stable handle of a block. Handles are recycled once a block is merged
/// away, so never hold on to one across a call that may coalesce.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(usize);

impl BlockId {
    pub(crate) const MIN: BlockId = BlockId(0);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Block {
    /// Offset of the payload from the arena base
    pub offset: usize,
    /// Payload size in bytes
    pub size: usize,
    pub prev: Option<BlockId>,
    pub next: Option<BlockId>,
    pub free: bool,
}

impl Block {
    /// One past the last payload byte. Always the `offset` of `next`.
    pub const fn end(&self) -> usize {
        self.offset + self.size
    }
}

#[derive(Debug, Default)]
pub(crate) struct BlockList {
    slots: Vec<Option<Block>>,
    vacant: Vec<BlockId>,
    head: Option<BlockId>,
    tail: Option<BlockId>,
    by_offset: HashMap<usize, BlockId>,
}

impl BlockList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head(&self) -> Option<BlockId> {
        self.head
    }

    pub fn tail(&self) -> Option<BlockId> {
        self.tail
    }

    /// Number of live blocks
    pub fn len(&self) -> usize {
        self.by_offset.len()
    }

    /// The block whose payload starts exactly at `offset`.
    pub fn at_offset(&self, offset: usize) -> Option<BlockId> {
        self.by_offset.get(&offset).copied()
    }

    pub fn get(&self, id: BlockId) -> &Block {
        self.slots[id.0].as_ref().expect("stale block handle")
    }

    pub fn get_mut(&mut self, id: BlockId) -> &mut Block {
        self.slots[id.0].as_mut().expect("stale block handle")
    }

    fn store(&mut self, block: Block) -> BlockId {
        let id = match self.vacant.pop() {
            Some(id) => {
                self.slots[id.0] = Some(block);
                id
            }
            None => {
                self.slots.push(Some(block));
                BlockId(self.slots.len() - 1)
            }
        };
        self.by_offset.insert(block.offset, id);
        id
    }

    /// Append a block after the current tail. The caller guarantees that
    /// `offset` is the tail's `end()` (or 0 for the first block).
    pub fn push_back(&mut self, offset: usize, size: usize, free: bool) -> BlockId {
        let id = self.store(Block {
            offset,
            size,
            prev: self.tail,
            next: None,
            free,
        });
        match self.tail {
            Some(tail) => self.get_mut(tail).next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        id
    }

    /// Link a new block directly after `after`.
    pub fn insert_after(&mut self, after: BlockId, offset: usize, size: usize, free: bool) -> BlockId {
        let next = self.get(after).next;
        let id = self.store(Block {
            offset,
            size,
            prev: Some(after),
            next,
            free,
        });
        self.get_mut(after).next = Some(id);
        match next {
            Some(next) => self.get_mut(next).prev = Some(id),
            None => self.tail = Some(id),
        }
        id
    }

    /// Unlink `id` and recycle its handle. Its bytes must already have been
    /// given to a neighbour.
    pub fn remove(&mut self, id: BlockId) -> Block {
        let block = self.slots[id.0].take().expect("stale block handle");
        match block.prev {
            Some(prev) => self.get_mut(prev).next = block.next,
            None => self.head = block.next,
        }
        match block.next {
            Some(next) => self.get_mut(next).prev = block.prev,
            None => self.tail = block.prev,
        }
        self.by_offset.remove(&block.offset);
        self.vacant.push(id);
        block
    }

    /// Walk the blocks in address order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            current: self.head,
        }
    }
}

pub(crate) struct Iter<'a> {
    list: &'a BlockList,
    current: Option<BlockId>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (BlockId, &'a Block);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.current?;
        let block = self.list.get(id);
        self.current = block.next;
        Some((id, block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_list_is_empty() {
        let list = BlockList::new();
        assert_eq!(list.len(), 0);
        assert!(list.head().is_none());
        assert!(list.iter().next().is_none());
    }

    #[test]
    fn insert_and_remove_keep_links() {
        let mut list = BlockList::new();
        let a = list.push_back(0, 32, false);
        let c = list.push_back(64, 32, false);
        let b = list.insert_after(a, 32, 32, true);

        let offsets: Vec<_> = list.iter().map(|(_, b)| b.offset).collect();
        assert_eq!(offsets, [0, 32, 64]);
        assert_eq!(list.get(c).prev, Some(b));
        assert_eq!(list.at_offset(32), Some(b));

        list.remove(b);
        assert_eq!(list.get(a).next, Some(c));
        assert_eq!(list.get(c).prev, Some(a));
        assert_eq!(list.at_offset(32), None);

        list.remove(c);
        assert_eq!(list.tail(), Some(a));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn handles_are_recycled() {
        let mut list = BlockList::new();
        let a = list.push_back(0, 32, false);
        let b = list.push_back(32, 32, false);
        list.remove(b);
        let c = list.insert_after(a, 32, 16, true);
        assert_eq!(b, c);
        assert_eq!(list.get(c).size, 16);
    }
}
