//! One allocation interface over two backends: the platform heap, or (once
//! [`MemoryManager::enable_page_pool()`] has been called) a [`PageAllocator`]
//! over huge pages. On top of that sit the bit vector storage rules in
//! [`MemoryManager::resize()`] and [`MemoryManager::clear()`], which report
//! every change in storage size to the [`UsageProfiler`].

use std::{
    cmp, fmt,
    ptr::{self, NonNull},
    sync::{Mutex, MutexGuard, PoisonError},
};

use log::{debug, info, warn};
use once_cell::sync::OnceCell;

use super::{
    bitvec::BitStorage,
    manual,
    page::{ArenaStats, PageAllocator},
};
use crate::{
    config::MemoryConfig,
    error::MemError,
    monitor::UsageProfiler,
    os::mem::PageSource,
    util::{
        hint::cold,
        num::{padded_bytes, words_in_bytes},
    },
};

/// The memory context of a process. Construct one, share it by reference.
///
/// The page pool is a one-way switch: once enabled it stays enabled, and
/// pointers from the platform heap handed out before that keep being routed
/// back to the heap.
#[derive(Default)]
pub struct MemoryManager {
    pool: OnceCell<Mutex<PageAllocator>>,
    monitor: UsageProfiler,
}

impl MemoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a manager from `config`, enabling the huge page pool if it asks
    /// for one.
    pub fn with_config(config: &MemoryConfig) -> Result<Self, MemError> {
        let manager = Self::new();
        manager.monitor.set_granularity(config.log_granularity());
        if let Some(pool) = &config.page_pool {
            manager.enable_page_pool(&default_page_source()?, pool.size.bytes())?;
        }
        Ok(manager)
    }

    pub fn monitor(&self) -> &UsageProfiler {
        &self.monitor
    }

    /// Reserve `bytes` from `source` and serve every allocation from there
    /// from now on. `bytes == 0` takes all the capacity `source` reports.
    pub fn enable_page_pool(&self, source: &dyn PageSource, bytes: usize) -> Result<(), MemError> {
        if self.pool.get().is_some() {
            return Err(MemError::PagePoolAlreadyEnabled);
        }
        let allocator = PageAllocator::initialize(source, bytes)?;
        let reserved = allocator.stats().reserved;
        self.pool
            .set(Mutex::new(allocator))
            .map_err(|_| MemError::PagePoolAlreadyEnabled)?;
        info!("page pool enabled with {reserved} bytes");
        Ok(())
    }

    pub fn page_pool_enabled(&self) -> bool {
        self.pool.get().is_some()
    }

    pub fn page_pool_stats(&self) -> Option<ArenaStats> {
        self.pool().map(|pool| pool.stats())
    }

    fn pool(&self) -> Option<MutexGuard<'_, PageAllocator>> {
        self.pool
            .get()
            .map(|pool| pool.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// `n` zeroed bytes.
    pub fn alloc(&self, n: usize) -> Result<NonNull<u8>, MemError> {
        match self.pool() {
            Some(mut pool) => {
                let data = pool.allocate(n)?;
                // SAFETY: the block is at least `n` bytes and nobody else
                // has it yet.
                unsafe { data.as_ptr().write_bytes(0, n) };
                Ok(data)
            }
            None => manual::calloc(n),
        }
    }

    /// Addresses inside the page pool that were never handed out are
    /// rejected with [`MemError::InvalidPointer`].
    ///
    /// # Safety
    ///
    /// `data` must be null or a live pointer from this manager's
    /// [`alloc()`](Self::alloc)/[`realloc()`](Self::realloc), and must not be
    /// used afterwards.
    pub unsafe fn free(&self, data: *mut u8) -> Result<(), MemError> {
        if let Some(mut pool) = self.pool() {
            if pool.owns(data) {
                return pool.free(data);
            }
            if pool.in_region(data) {
                return Err(invalid_pointer(data));
            }
        }
        // SAFETY: not from the pool, so from the heap (caller contract).
        unsafe { manual::free(data) };
        Ok(())
    }

    /// Resize to `n` bytes, keeping the first `min(old, n)`. Bytes past the
    /// old size are unspecified. On error `data` is still valid.
    ///
    /// # Safety
    ///
    /// Same as [`free()`](Self::free), except that `data` may be used again
    /// if this returns an error.
    pub unsafe fn realloc(&self, data: *mut u8, n: usize) -> Result<NonNull<u8>, MemError> {
        if let Some(mut pool) = self.pool() {
            if pool.owns(data) {
                return pool.reallocate(data, n);
            }
            if pool.in_region(data) {
                return Err(invalid_pointer(data));
            }
        }
        // SAFETY: not from the pool, so from the heap (caller contract).
        unsafe { manual::realloc(data, n) }
    }

    /// Set the length of `v` to `len` bits.
    ///
    /// Storage is reallocated when the number of words changes, when the
    /// padding word needed at a multiple of 64 is missing, or when `v` has no
    /// storage yet (unless `len` is 0). After reallocating, every bit from
    /// the shorter of the two lengths to the end of the storage is zero. Only
    /// a change in the number of words is reported to the profiler.
    ///
    /// On error `v` is unchanged. A `len` whose storage size does not fit in
    /// a `usize` is [`MemError::OutOfMemory`].
    pub fn resize<V: BitStorage>(&self, v: &mut V, len: u64) -> Result<(), MemError> {
        let old_len = v.bit_len();
        let (old_bytes, old_padded) = storage_bytes(old_len)?;
        let (new_bytes, allocated) = storage_bytes(len)?;
        let capacity_changed = old_bytes != new_bytes;
        let needs_storage = match v.data() {
            Some(_) => allocated > old_padded,
            None => len > 0,
        };

        if !capacity_changed && !needs_storage {
            // SAFETY: the storage already covers `padded_bytes(len)`.
            unsafe { v.set_bit_len(len) };
            return Ok(());
        }

        let (old_data, keep) = match v.data() {
            Some(data) => (data.as_ptr() as *mut u8, cmp::min(old_len, len)),
            None => (ptr::null_mut(), 0),
        };
        // SAFETY: `BitStorage` guarantees `old_data` came from us.
        let data = unsafe { self.realloc(old_data, allocated)? }.cast::<u64>();
        // SAFETY: `data` holds exactly `padded_bytes(len)` bytes.
        unsafe {
            v.set_data(Some(data));
            v.set_bit_len(len);
        }
        debug!("bit vector resized {old_len} -> {len} bits ({allocated} bytes)");

        // SAFETY: `allocated` bytes starting at `data`, uniquely ours.
        let words = unsafe { std::slice::from_raw_parts_mut(data.as_ptr(), allocated / 8) };
        zero_bits_from(words, keep);

        if capacity_changed {
            self.monitor.record(new_bytes as i64 - old_bytes as i64);
        }
        Ok(())
    }

    /// Free the storage of `v` and make it empty.
    pub fn clear<V: BitStorage>(&self, v: &mut V) -> Result<(), MemError> {
        let (bytes, _) = storage_bytes(v.bit_len())?;
        if let Some(data) = v.data() {
            // SAFETY: `BitStorage` guarantees `data` came from us, and we
            // forget it right below.
            unsafe { self.free(data.as_ptr() as *mut u8)? };
        }
        // SAFETY: no storage, no length.
        unsafe {
            v.set_data(None);
            v.set_bit_len(0);
        }
        if bytes > 0 {
            self.monitor.record(-(bytes as i64));
        }
        Ok(())
    }
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("page_pool", &self.page_pool_stats())
            .field("monitor", &self.monitor)
            .finish()
    }
}

fn invalid_pointer(data: *const u8) -> MemError {
    cold(|| {
        warn!("{data:p} is inside the page pool but was never handed out");
        MemError::InvalidPointer { addr: data as usize }
    })
}

/// `(words_in_bytes, padded_bytes)` of a `bits` long vector.
fn storage_bytes(bits: u64) -> Result<(u64, usize), MemError> {
    match (
        words_in_bytes(bits),
        padded_bytes(bits).and_then(|b| usize::try_from(b).ok()),
    ) {
        (Some(words), Some(padded)) => Ok((words, padded)),
        _ => cold(|| {
            warn!("a {bits} bit vector cannot be addressed");
            Err(MemError::OutOfMemory {
                requested: usize::MAX,
                available: 0,
            })
        }),
    }
}

/// Clear every bit at or after `from`.
fn zero_bits_from(words: &mut [u64], from: u64) {
    let first = (from >> 6) as usize;
    if first >= words.len() {
        return;
    }
    words[first] &= (1u64 << (from & 63)) - 1;
    words[first + 1..].fill(0);
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn default_page_source() -> Result<impl PageSource, MemError> {
    Ok(crate::os::mem::HugePages)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn default_page_source() -> Result<crate::os::mem::HeapPages, MemError> {
    Err(MemError::Config(
        "huge pages are not supported on this platform".into(),
    ))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{alloc::bitvec::RawBitVec, os::mem::HeapPages};

    fn pooled() -> MemoryManager {
        let manager = MemoryManager::new();
        manager.enable_page_pool(&HeapPages, 1 << 20).unwrap();
        manager
    }

    /// Every delta gets its own pair of samples, so the peak is exact.
    fn tracking(manager: &MemoryManager) {
        manager.monitor().set_granularity(Duration::ZERO);
        manager.monitor().start();
    }

    #[test]
    fn zero_bits_from_masks_partial_words() {
        let mut words = [u64::MAX; 3];
        zero_bits_from(&mut words, 70);
        assert_eq!(words, [u64::MAX, (1 << 6) - 1, 0]);
        zero_bits_from(&mut words, 64);
        assert_eq!(words, [u64::MAX, 0, 0]);
        zero_bits_from(&mut words, 192);
        assert_eq!(words, [u64::MAX, 0, 0]);
    }

    #[test]
    fn heap_alloc_is_zeroed_and_reallocatable() {
        let manager = MemoryManager::new();
        unsafe {
            let data = manager.alloc(32).unwrap();
            assert!((0..32).all(|i| *data.as_ptr().add(i) == 0));
            data.as_ptr().write_bytes(9, 32);
            let data = manager.realloc(data.as_ptr(), 1024).unwrap();
            assert_eq!(*data.as_ptr().add(31), 9);
            manager.free(data.as_ptr()).unwrap();
        }
    }

    #[test]
    fn pool_alloc_is_zeroed_even_when_reused() {
        let manager = pooled();
        unsafe {
            let data = manager.alloc(64).unwrap();
            data.as_ptr().write_bytes(0xff, 64);
            manager.free(data.as_ptr()).unwrap();
            let again = manager.alloc(64).unwrap();
            assert_eq!(again, data);
            assert!((0..64).all(|i| *again.as_ptr().add(i) == 0));
        }
    }

    #[test]
    fn heap_pointers_survive_enabling_the_pool() {
        let manager = MemoryManager::new();
        let before = manager.alloc(16).unwrap();
        manager.enable_page_pool(&HeapPages, 1 << 16).unwrap();
        let after = manager.alloc(16).unwrap();

        let stats = manager.page_pool_stats().unwrap();
        assert_eq!(stats.allocated_bytes, 32);
        unsafe {
            let before = manager.realloc(before.as_ptr(), 4096).unwrap();
            manager.free(before.as_ptr()).unwrap();
            manager.free(after.as_ptr()).unwrap();
        }
        assert_eq!(manager.page_pool_stats().unwrap().allocated_bytes, 0);
    }

    #[test]
    fn page_pool_is_one_way() {
        let manager = pooled();
        assert!(manager.page_pool_enabled());
        assert!(matches!(
            manager.enable_page_pool(&HeapPages, 4096),
            Err(MemError::PagePoolAlreadyEnabled)
        ));
    }

    #[test]
    fn resize_pads_exact_multiples_of_64() {
        for manager in [MemoryManager::new(), pooled()] {
            let mut v = RawBitVec::new();
            manager.resize(&mut v, 64).unwrap();
            assert_eq!(v.words().len(), 2);
            assert_eq!(v.words()[1], 0);
            v.words_mut()[0] = u64::MAX;
            assert_eq!(v.rank(64), 64);

            manager.resize(&mut v, 65).unwrap();
            assert_eq!(v.capacity(), 128);
            assert_eq!(v.words().len(), 2);
            assert_eq!(v.words()[0], u64::MAX);
            assert!(!v.get(64));
            assert_eq!(v.words()[1], 0);
            manager.clear(&mut v).unwrap();
        }
    }

    #[test]
    fn resize_zeroes_storage_past_the_old_end() {
        for manager in [MemoryManager::new(), pooled()] {
            let mut v = RawBitVec::new();
            manager.resize(&mut v, 100).unwrap();
            v.words_mut().fill(u64::MAX);
            // Same word count: logical change only, nothing zeroed.
            manager.resize(&mut v, 70).unwrap();
            assert_eq!(v.words()[1], u64::MAX);

            manager.resize(&mut v, 1000).unwrap();
            assert_eq!(v.rank(70), 70);
            assert_eq!(v.rank(1000), 70);
            assert!(v.words()[2..].iter().all(|&w| w == 0));
            manager.clear(&mut v).unwrap();
        }
    }

    #[test]
    fn resize_adds_missing_padding_word() {
        let manager = MemoryManager::new();
        let mut v = RawBitVec::new();
        manager.resize(&mut v, 60).unwrap();
        assert_eq!(v.words().len(), 1);
        manager.resize(&mut v, 64).unwrap();
        assert_eq!(v.words().len(), 2);
        assert_eq!(v.words()[1], 0);
        manager.clear(&mut v).unwrap();
    }

    #[test]
    fn resize_reports_only_capacity_changes() {
        let manager = MemoryManager::new();
        tracking(&manager);
        let mut v = RawBitVec::new();

        manager.resize(&mut v, 65).unwrap();
        assert_eq!(manager.monitor().current_usage(), 16);
        let data = v.data();
        manager.resize(&mut v, 65).unwrap();
        assert_eq!(v.data(), data);
        assert_eq!(manager.monitor().current_usage(), 16);

        manager.resize(&mut v, 128).unwrap();
        assert_eq!(manager.monitor().current_usage(), 16);
        manager.resize(&mut v, 129).unwrap();
        assert_eq!(manager.monitor().current_usage(), 24);
        manager.resize(&mut v, 10).unwrap();
        assert_eq!(manager.monitor().current_usage(), 8);

        manager.clear(&mut v).unwrap();
        assert_eq!(manager.monitor().current_usage(), 0);
        assert!(v.data().is_none());
        assert!(v.is_empty());

        manager.resize(&mut v, 0).unwrap();
        assert!(v.data().is_none());
        assert_eq!(manager.monitor().current_usage(), 0);
        manager.monitor().stop();
        assert_eq!(manager.monitor().peak(), 24);
    }

    #[test]
    fn resize_to_zero_keeps_padding_word() {
        let manager = MemoryManager::new();
        let mut v = RawBitVec::new();
        manager.resize(&mut v, 0).unwrap();
        assert!(v.data().is_none());
        manager.resize(&mut v, 1).unwrap();
        manager.resize(&mut v, 0).unwrap();
        assert_eq!(v.words(), &[0]);
        assert_eq!(v.rank(0), 0);
        manager.clear(&mut v).unwrap();
    }

    #[test]
    fn unaddressable_lengths_leave_vector_intact() {
        for manager in [MemoryManager::new(), pooled()] {
            tracking(&manager);
            let mut v = RawBitVec::new();
            manager.resize(&mut v, 100).unwrap();
            v.set(99, true);
            let data = v.data();

            for len in [u64::MAX, u64::MAX - 63] {
                let err = manager.resize(&mut v, len).unwrap_err();
                assert!(matches!(err, MemError::OutOfMemory { .. }), "{len}: {err}");
                assert_eq!(v.len(), 100);
                assert_eq!(v.data(), data);
                assert!(v.get(99));
                assert_eq!(manager.monitor().current_usage(), 16);
            }
            manager.clear(&mut v).unwrap();
            manager.monitor().stop();
        }
    }

    #[test]
    fn unused_pool_addresses_are_not_sent_to_the_heap() {
        let manager = pooled();
        let data = manager.alloc(32).unwrap();
        let above_top = unsafe { data.as_ptr().add(1024) };
        unsafe {
            assert!(matches!(
                manager.free(above_top),
                Err(MemError::InvalidPointer { .. })
            ));
            assert!(matches!(
                manager.realloc(above_top, 64),
                Err(MemError::InvalidPointer { .. })
            ));
        }
        let stats = manager.page_pool_stats().unwrap();
        assert_eq!(stats.allocated_bytes, 32);
        assert_eq!(stats.top, 32);
        unsafe { manager.free(data.as_ptr()).unwrap() };
    }

    #[test]
    fn pool_exhaustion_leaves_vector_intact() {
        let manager = MemoryManager::new();
        manager.enable_page_pool(&HeapPages, 4096).unwrap();
        let reserved = manager.page_pool_stats().unwrap().reserved as u64;
        let mut v = RawBitVec::new();
        manager.resize(&mut v, 256).unwrap();
        v.set(3, true);

        let err = manager.resize(&mut v, reserved * 8 * 2).unwrap_err();
        assert!(matches!(err, MemError::OutOfMemory { .. }));
        assert_eq!(v.len(), 256);
        assert!(v.get(3));
        manager.clear(&mut v).unwrap();
        assert_eq!(manager.page_pool_stats().unwrap().allocated_bytes, 0);
    }
}
