//! The platform heap (`calloc`/`realloc`/`free`). Unlike Rust's global
//! allocator these do not need the old size, which is exactly the interface
//! [`MemoryManager`](super::manager::MemoryManager) has to serve.

use std::{cmp, ptr::NonNull};

use crate::{error::MemError, util::hint::cold};

/// Zero-initialised allocation of `size` bytes.
pub fn calloc(size: usize) -> Result<NonNull<u8>, MemError> {
    // `calloc(0)` may legally return null, which we reserve for failure.
    let size = cmp::max(size, 1);
    // SAFETY: `calloc` has no preconditions.
    let data = unsafe { libc::calloc(size, 1) } as *mut u8;
    NonNull::new(data).ok_or_else(|| {
        cold(|| MemError::OutOfMemory {
            requested: size,
            available: 0,
        })
    })
}

/// Resize a heap allocation. A null `data` allocates. On failure `data` is
/// left allocated and untouched.
///
/// # Safety
///
/// `data` must be null or a live pointer from [`calloc()`]/[`realloc()`].
pub unsafe fn realloc(data: *mut u8, size: usize) -> Result<NonNull<u8>, MemError> {
    // `realloc(p, 0)` frees `p` on some libcs, so never ask for 0.
    let size = cmp::max(size, 1);
    // SAFETY: Identical contract to caller.
    let new = unsafe { libc::realloc(data as _, size) } as *mut u8;
    NonNull::new(new).ok_or_else(|| {
        cold(|| MemError::OutOfMemory {
            requested: size,
            available: 0,
        })
    })
}

/// # Safety
///
/// `data` must be null or a live pointer from [`calloc()`]/[`realloc()`], and
/// must not be used afterwards.
pub unsafe fn free(data: *mut u8) {
    unsafe { libc::free(data as _) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calloc_zeroes() {
        let data = calloc(64).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(data.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe { free(data.as_ptr()) };
    }

    #[test]
    fn realloc_keeps_prefix() {
        unsafe {
            let data = realloc(std::ptr::null_mut(), 16).unwrap();
            data.as_ptr().write_bytes(0x5a, 16);
            let data = realloc(data.as_ptr(), 4096).unwrap();
            assert_eq!(*data.as_ptr().add(15), 0x5a);
            let data = realloc(data.as_ptr(), 0).unwrap();
            assert_eq!(*data.as_ptr(), 0x5a);
            free(data.as_ptr());
            free(std::ptr::null_mut());
        }
    }
}
