//! A free-list heap over one extent of (huge) pages.
//!
//! The extent is reserved once by [`PageAllocator::initialize()`]. Blocks are
//! carved from the front of it with a bump pointer (`top`) and recycled
//! through a best-fit [`FreeSet`]. Freed blocks are merged with free
//! neighbours straight away, so two free blocks are never adjacent.
//!
//! # Threading
//!
//! Every mutating method takes `&mut self` and there is no lock inside. One
//! owner at a time; wrap it in a `Mutex` to share it (which is what
//! [`MemoryManager`](super::manager::MemoryManager) does).

use std::{
    cmp, fmt,
    ptr::{self, NonNull},
};

use log::{debug, trace, warn};
use serde::Serialize;

use super::{
    block::{BlockId, BlockList},
    free_set::FreeSet,
};
use crate::{
    error::MemError,
    os::mem::{PageRegion, PageSource},
    util::{hint::cold, num::round_up},
};

/// Every payload size (and so every payload offset) is a multiple of this.
pub const ALIGNMENT: usize = std::mem::size_of::<u64>();

/// Smallest payload we ever hand out or leave behind after a split.
pub const MIN_BLOCK_SIZE: usize = 32;

/// A snapshot of how the arena is carved up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ArenaStats {
    /// Bytes reserved from the OS
    pub reserved: usize,
    /// Bytes handed to blocks so far (the high-water mark)
    pub top: usize,
    pub allocated_bytes: usize,
    pub free_bytes: usize,
    pub blocks: usize,
    pub free_blocks: usize,
}

pub struct PageAllocator {
    region: PageRegion,
    top: usize,
    blocks: BlockList,
    free: FreeSet,
}

impl PageAllocator {
    /// Reserve `size_in_bytes` from `source`. A size of zero means "whatever
    /// the source says is available", which for huge pages is the free part
    /// of the hugetlb pool.
    pub fn initialize(source: &dyn PageSource, size_in_bytes: usize) -> Result<Self, MemError> {
        let size = match size_in_bytes {
            0 => source
                .available()
                .filter(|&n| n > 0)
                .ok_or(MemError::NoHugePageCapacity)?,
            n => n,
        };
        let region = source.reserve(size)?;
        debug!(
            "page allocator reserved {} bytes at {:p}",
            region.len(),
            region.as_ptr()
        );
        Ok(Self {
            region,
            top: 0,
            blocks: BlockList::new(),
            free: FreeSet::new(),
        })
    }

    /// Hand out at least `n` bytes. The contents are unspecified.
    pub fn allocate(&mut self, n: usize) -> Result<NonNull<u8>, MemError> {
        let size = self.block_size_for(n)?;
        let id = match self.free.best_fit(size) {
            Some(id) => {
                self.take_free(id);
                self.split(id, size);
                id
            }
            None => self.grow(size)?,
        };
        Ok(self.payload(id))
    }

    /// Resize the allocation at `ptr` to `n` bytes, moving it only when it
    /// can neither shrink in place nor absorb a free right neighbour. The
    /// first `min(old, n)` bytes are preserved. A null `ptr` allocates.
    ///
    /// On error the original allocation is untouched.
    pub fn reallocate(&mut self, ptr: *mut u8, n: usize) -> Result<NonNull<u8>, MemError> {
        if ptr.is_null() {
            return self.allocate(n);
        }
        let id = self.live_block(ptr)?;
        let size = self.block_size_for(n)?;
        let block = *self.blocks.get(id);

        if size <= block.size {
            self.split(id, size);
            return Ok(self.payload(id));
        }

        if let Some(next) = block.next {
            let neighbour = *self.blocks.get(next);
            if neighbour.free && block.size + neighbour.size >= size {
                self.free.remove(neighbour.size, neighbour.offset, next);
                self.blocks.remove(next);
                self.blocks.get_mut(id).size += neighbour.size;
                self.split(id, size);
                return Ok(self.payload(id));
            }
        }

        let new = self.allocate(n)?;
        // SAFETY: `id` is still live (allocating never touches allocated
        // blocks), both payloads are inside the region, are distinct blocks
        // and the new one is larger than `block.size`.
        unsafe {
            ptr::copy_nonoverlapping(self.payload(id).as_ptr(), new.as_ptr(), block.size);
        }
        self.release(id);
        Ok(new)
    }

    /// Give the allocation at `ptr` back. Null is ignored.
    pub fn free(&mut self, ptr: *mut u8) -> Result<(), MemError> {
        if ptr.is_null() {
            return Ok(());
        }
        let id = self.live_block(ptr)?;
        self.release(id);
        Ok(())
    }

    /// Whether `ptr` lies in the part of the arena handed out so far. Null
    /// counts as ours so that freeing it can be routed here.
    pub fn owns(&self, ptr: *const u8) -> bool {
        if ptr.is_null() {
            return true;
        }
        let base = self.base();
        (base..base + self.top).contains(&(ptr as usize))
    }

    /// Whether `ptr` lies anywhere in the reserved extent, handed out or not.
    pub fn in_region(&self, ptr: *const u8) -> bool {
        let base = self.base();
        (base..base + self.region.len()).contains(&(ptr as usize))
    }

    /// Payload size of the live allocation at `ptr`.
    pub fn usable_size(&self, ptr: *const u8) -> Result<usize, MemError> {
        let id = self.live_block(ptr)?;
        Ok(self.blocks.get(id).size)
    }

    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            reserved: self.region.len(),
            top: self.top,
            allocated_bytes: self.top - self.free.bytes(),
            free_bytes: self.free.bytes(),
            blocks: self.blocks.len(),
            free_blocks: self.free.len(),
        }
    }

    /// Walk the whole block list and check every structural invariant:
    /// contiguity from offset 0 to `top`, consistent links, aligned sizes,
    /// no two free neighbours, and free-set membership matching the free
    /// flag. This is a test oracle; it is O(n) and nothing calls it on the
    /// allocation path.
    pub fn validate(&self) -> Result<(), String> {
        let mut expected_offset = 0;
        let mut prev: Option<BlockId> = None;
        let mut prev_free = false;
        let mut free_blocks = 0;
        let mut count = 0;

        for (id, block) in self.blocks.iter() {
            if block.prev != prev {
                return Err(format!("block at {} has a broken prev link", block.offset));
            }
            if block.offset != expected_offset {
                return Err(format!(
                    "gap or overlap: expected a block at {expected_offset}, found {}",
                    block.offset
                ));
            }
            if block.size < MIN_BLOCK_SIZE || block.size % ALIGNMENT != 0 {
                return Err(format!("block at {} has bad size {}", block.offset, block.size));
            }
            if block.free && prev_free {
                return Err(format!("free block at {} follows a free block", block.offset));
            }
            if block.free != self.free.contains(block.size, block.offset, id) {
                return Err(format!(
                    "block at {} is free={} but free-set membership disagrees",
                    block.offset, block.free
                ));
            }
            if self.blocks.at_offset(block.offset) != Some(id) {
                return Err(format!("block at {} is not indexed by offset", block.offset));
            }
            free_blocks += block.free as usize;
            count += 1;
            prev_free = block.free;
            prev = Some(id);
            expected_offset = block.end();
        }

        if expected_offset != self.top {
            return Err(format!(
                "blocks end at {expected_offset} but top is {}",
                self.top
            ));
        }
        if self.blocks.tail() != prev {
            return Err("tail does not point at the last block".into());
        }
        if free_blocks != self.free.len() {
            return Err(format!(
                "{free_blocks} free blocks in the list, {} in the free set",
                self.free.len()
            ));
        }
        if count != self.blocks.len() {
            return Err(format!(
                "{count} reachable blocks, {} indexed",
                self.blocks.len()
            ));
        }
        Ok(())
    }

    fn base(&self) -> usize {
        self.region.as_ptr() as usize
    }

    fn payload(&self, id: BlockId) -> NonNull<u8> {
        let offset = self.blocks.get(id).offset;
        debug_assert!(offset < self.region.len());
        // SAFETY: every block lies inside the region, and the region pointer
        // is non-null.
        unsafe { NonNull::new_unchecked(self.region.as_ptr().add(offset)) }
    }

    fn block_size_for(&self, n: usize) -> Result<usize, MemError> {
        match round_up(n, ALIGNMENT) {
            Some(size) if n <= self.region.len() => Ok(cmp::max(size, MIN_BLOCK_SIZE)),
            _ => cold(|| {
                warn!("page allocator cannot fit {n} bytes at all");
                Err(MemError::OutOfMemory {
                    requested: n,
                    available: self.region.len() - self.top,
                })
            }),
        }
    }

    /// The allocated block that starts exactly at `ptr`.
    fn live_block(&self, ptr: *const u8) -> Result<BlockId, MemError> {
        let addr = ptr as usize;
        let invalid = MemError::InvalidPointer { addr };
        if !self.owns(ptr) || ptr.is_null() {
            return Err(invalid);
        }
        match self.blocks.at_offset(addr - self.base()) {
            Some(id) if !self.blocks.get(id).free => Ok(id),
            _ => Err(invalid),
        }
    }

    /// Move `len` more bytes of the region below `top`, returning where they
    /// start.
    fn bump(&mut self, len: usize) -> Result<usize, MemError> {
        let available = self.region.len() - self.top;
        if len > available {
            return cold(|| {
                warn!("page allocator exhausted: {len} bytes requested, {available} left");
                Err(MemError::OutOfMemory {
                    requested: len,
                    available,
                })
            });
        }
        let offset = self.top;
        self.top += len;
        debug!("page allocator top grew to {}", self.top);
        Ok(offset)
    }

    /// Make room for a `size` block at the end of the arena. A free tail is
    /// stretched instead of leaving it stranded in front of the new block.
    fn grow(&mut self, size: usize) -> Result<BlockId, MemError> {
        match self.blocks.tail() {
            Some(tail) if self.blocks.get(tail).free => {
                let missing = size - self.blocks.get(tail).size;
                self.bump(missing)?;
                self.take_free(tail);
                self.blocks.get_mut(tail).size = size;
                Ok(tail)
            }
            _ => {
                let offset = self.bump(size)?;
                Ok(self.blocks.push_back(offset, size, false))
            }
        }
    }

    /// Pull a free block out of the free set and mark it allocated.
    fn take_free(&mut self, id: BlockId) {
        let block = self.blocks.get_mut(id);
        debug_assert!(block.free);
        block.free = false;
        let (size, offset) = (block.size, block.offset);
        self.free.remove(size, offset, id);
    }

    /// Trim block `id` down to `size`, turning the rest into a free block if
    /// it is big enough to be one.
    fn split(&mut self, id: BlockId, size: usize) {
        let block = *self.blocks.get(id);
        debug_assert!(block.size >= size);
        let rest = block.size - size;
        if rest < MIN_BLOCK_SIZE {
            return;
        }
        trace!("split block at {}: {} + {}", block.offset, size, rest);
        self.blocks.get_mut(id).size = size;
        let rest_id = self.blocks.insert_after(id, block.offset + size, rest, false);
        self.release(rest_id);
    }

    /// Mark `id` free, merge it with free neighbours and file the result in
    /// the free set.
    fn release(&mut self, mut id: BlockId) {
        let block = *self.blocks.get(id);

        if let Some(next) = block.next {
            let neighbour = *self.blocks.get(next);
            if neighbour.free {
                trace!("coalesce {} with right {}", block.offset, neighbour.offset);
                self.free.remove(neighbour.size, neighbour.offset, next);
                self.blocks.remove(next);
                self.blocks.get_mut(id).size += neighbour.size;
            }
        }

        if let Some(prev) = block.prev {
            let neighbour = *self.blocks.get(prev);
            if neighbour.free {
                trace!("coalesce {} with left {}", block.offset, neighbour.offset);
                self.free.remove(neighbour.size, neighbour.offset, prev);
                let merged = self.blocks.remove(id);
                self.blocks.get_mut(prev).size += merged.size;
                id = prev;
            }
        }

        let block = self.blocks.get_mut(id);
        block.free = true;
        let (size, offset) = (block.size, block.offset);
        self.free.insert(size, offset, id);
    }
}

impl fmt::Debug for PageAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageAllocator")
            .field("region", &self.region)
            .field("stats", &self.stats())
            .finish()
    }
}
