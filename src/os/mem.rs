//! Page reservation. The allocator asks a [`PageSource`] for one extent of
//! memory up front and never talks to the OS directly, so every platform
//! difference lives in this file.

use std::{
    alloc::{self, Layout},
    fs, io,
    ptr::NonNull,
};

use log::debug;
use once_cell::sync::Lazy;

use crate::{
    error::MemError,
    util::{hint::cold, num::round_up},
};

static PAGE_SIZE: Lazy<usize> = Lazy::new(page_size::get);

/// Used when `/proc/meminfo` does not tell us the huge page size.
const DEFAULT_HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

enum Backing {
    #[cfg(unix)]
    Mapped,
    Heap(Layout),
}

/// An owned, page-aligned, zero-initialised extent of memory. Returned to
/// wherever it came from on drop.
pub struct PageRegion {
    ptr: NonNull<u8>,
    len: usize,
    backing: Backing,
}

// SAFETY: `PageRegion` uniquely owns its extent, exactly like a `Box<[u8]>`.
unsafe impl Send for PageRegion {}

impl PageRegion {
    /// `mmap()` an anonymous, private, read/write extent of `len` bytes with
    /// some extra `flags` (e.g. `MAP_HUGETLB`). `len` must already be rounded
    /// to the page size the kernel expects for those flags.
    #[cfg(unix)]
    fn map_anonymous(len: usize, flags: libc::c_int) -> Result<Self, MemError> {
        if len == 0 {
            return Err(MemError::MapFailed {
                len,
                source: io::Error::new(io::ErrorKind::InvalidInput, "empty page region"),
            });
        }
        // SAFETY: A fresh anonymous mapping at an address of the kernel's
        // choosing cannot alias anything we own.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return cold(|| {
                Err(MemError::MapFailed {
                    len,
                    source: io::Error::last_os_error(),
                })
            });
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or(MemError::OutOfMemory {
            requested: len,
            available: 0,
        })?;
        debug!("mapped {len} bytes at {:p}", ptr);
        Ok(Self {
            ptr,
            len,
            backing: Backing::Mapped,
        })
    }

    /// Take a page-aligned extent from the global heap instead of the OS.
    fn from_heap(len: usize) -> Result<Self, MemError> {
        if len == 0 {
            return Err(MemError::MapFailed {
                len,
                source: io::Error::new(io::ErrorKind::InvalidInput, "empty page region"),
            });
        }
        let layout = Layout::from_size_align(len, *PAGE_SIZE).map_err(|_| {
            MemError::OutOfMemory {
                requested: len,
                available: 0,
            }
        })?;
        // SAFETY: `len` is non-zero, checked above.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(MemError::OutOfMemory {
            requested: len,
            available: 0,
        })?;
        Ok(Self {
            ptr,
            len,
            backing: Backing::Heap(layout),
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for PageRegion {
    fn drop(&mut self) {
        match self.backing {
            #[cfg(unix)]
            // SAFETY: `ptr` and `len` are exactly what `mmap()` gave us, and
            // nobody can hold a borrow of the region while we are dropped.
            Backing::Mapped => unsafe {
                libc::munmap(self.ptr.as_ptr() as _, self.len);
            },
            // SAFETY: same layout as the allocation.
            Backing::Heap(layout) => unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) },
        }
    }
}

impl std::fmt::Debug for PageRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageRegion")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// Where the page allocator gets its arena from.
pub trait PageSource {
    /// Reserve at least `len` bytes (`len > 0`). Failure must not leave a
    /// mapping behind.
    fn reserve(&self, len: usize) -> Result<PageRegion, MemError>;

    /// How many bytes this source could hand out right now, when that can be
    /// known at all. Used when the pool is enabled with a size of zero.
    fn available(&self) -> Option<usize> {
        None
    }
}

/// Huge pages from the kernel's hugetlb pool (`MAP_HUGETLB`). Needs pages to
/// be reserved beforehand, e.g. through `/proc/sys/vm/nr_hugepages`.
#[cfg(any(target_os = "linux", target_os = "android"))]
#[derive(Debug, Clone, Copy, Default)]
pub struct HugePages;

#[cfg(any(target_os = "linux", target_os = "android"))]
impl PageSource for HugePages {
    fn reserve(&self, len: usize) -> Result<PageRegion, MemError> {
        PageRegion::map_anonymous(page_rounded(len, huge_page_size())?, libc::MAP_HUGETLB)
    }

    fn available(&self) -> Option<usize> {
        available_hugepage_memory()
    }
}

/// Ordinary anonymous pages, reserved lazily (`MAP_NORESERVE`). Behaves like
/// [`HugePages`] on machines without a hugetlb pool.
#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousPages;

#[cfg(unix)]
impl PageSource for AnonymousPages {
    fn reserve(&self, len: usize) -> Result<PageRegion, MemError> {
        PageRegion::map_anonymous(page_rounded(len, *PAGE_SIZE)?, libc::MAP_NORESERVE)
    }
}

/// Page-aligned memory from the global allocator. Works everywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapPages;

impl PageSource for HeapPages {
    fn reserve(&self, len: usize) -> Result<PageRegion, MemError> {
        PageRegion::from_heap(page_rounded(len.max(1), *PAGE_SIZE)?)
    }
}

/// `len` rounded up to whole pages of `page_size` bytes.
fn page_rounded(len: usize, page_size: usize) -> Result<usize, MemError> {
    round_up(len, page_size).ok_or_else(|| {
        cold(|| MemError::OutOfMemory {
            requested: len,
            available: 0,
        })
    })
}

/// Free huge page memory in bytes, as reported by `/proc/meminfo`.
pub fn available_hugepage_memory() -> Option<usize> {
    let meminfo = fs::read_to_string("/proc/meminfo").ok()?;
    let info = HugePageInfo::parse(&meminfo);
    Some(info.free? * info.page_size?)
}

/// The kernel's default huge page size.
pub fn huge_page_size() -> usize {
    fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|meminfo| HugePageInfo::parse(&meminfo).page_size)
        .unwrap_or(DEFAULT_HUGE_PAGE_SIZE)
}

#[derive(Debug, Default, PartialEq, Eq)]
struct HugePageInfo {
    /// Number of free huge pages
    free: Option<usize>,
    /// Size of one huge page in bytes
    page_size: Option<usize>,
}

impl HugePageInfo {
    fn parse(meminfo: &str) -> Self {
        let mut info = Self::default();
        for line in meminfo.lines() {
            let mut fields = line.split_whitespace();
            let key = fields.next();
            let value = fields.next().and_then(|v| v.parse::<usize>().ok());
            match key {
                Some("HugePages_Free:") => info.free = value,
                // Always given in kB
                Some("Hugepagesize:") => info.page_size = value.map(|kb| kb * 1024),
                _ => {}
            }
        }
        info
    }
}
