//! Files mapped into memory, for vectors that are loaded straight from disk.

use std::{
    fs::{File, OpenOptions},
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    ptr::{self, NonNull},
    slice,
};

use log::{debug, warn};

use crate::error::MemError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapMode {
    Read,
    ReadWrite,
}

impl MapMode {
    fn prot(self) -> libc::c_int {
        match self {
            MapMode::Read => libc::PROT_READ,
            MapMode::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }
}

/// A whole file mapped with `MAP_SHARED`, so writes in
/// [`MapMode::ReadWrite`] reach the file. Unmapped and closed on drop.
#[derive(Debug)]
pub struct MappedFile {
    path: PathBuf,
    file: File,
    mode: MapMode,
    /// `None` while the file is empty, since zero-length mappings are not a
    /// thing.
    data: Option<NonNull<u8>>,
    len: usize,
}

// SAFETY: the mapping is owned exclusively, and `as_mut_slice` needs `&mut`.
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    pub fn open(path: impl AsRef<Path>, mode: MapMode) -> Result<Self, MemError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(mode == MapMode::ReadWrite)
            .open(path)
            .map_err(|source| MemError::Io {
                context: format!("opening {}", path.display()),
                source,
            })?;
        let len = file_len(&file, path)?;
        let mut mapped = Self {
            path: path.to_owned(),
            file,
            mode,
            data: None,
            len: 0,
        };
        mapped.map(len)?;
        Ok(mapped)
    }

    fn map(&mut self, len: usize) -> Result<(), MemError> {
        debug_assert!(self.data.is_none());
        self.len = len;
        if len == 0 {
            return Ok(());
        }
        // SAFETY: a fresh shared mapping of a file we hold open.
        let data = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                self.mode.prot(),
                libc::MAP_SHARED,
                self.file.as_raw_fd(),
                0,
            )
        };
        if data == libc::MAP_FAILED {
            self.len = 0;
            return Err(MemError::last_os_error(format!(
                "mapping {} ({len} bytes)",
                self.path.display()
            )));
        }
        debug!("mapped {} ({len} bytes) at {data:p}", self.path.display());
        self.data = NonNull::new(data as *mut u8);
        Ok(())
    }

    fn unmap(&mut self) -> Result<(), MemError> {
        let Some(data) = self.data.take() else {
            return Ok(());
        };
        // SAFETY: `data`/`len` describe our mapping, and it is forgotten
        // above so it can never be used again.
        if unsafe { libc::munmap(data.as_ptr() as _, self.len) } != 0 {
            return Err(MemError::last_os_error(format!(
                "unmapping {}",
                self.path.display()
            )));
        }
        self.len = 0;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> MapMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match self.data {
            // SAFETY: `len` readable bytes for as long as we live.
            Some(data) => unsafe { slice::from_raw_parts(data.as_ptr(), self.len) },
            None => &[],
        }
    }

    /// `None` for read-only mappings.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        if self.mode != MapMode::ReadWrite {
            return None;
        }
        Some(match self.data {
            // SAFETY: writable, and `&mut self` makes the borrow unique.
            Some(data) => unsafe { slice::from_raw_parts_mut(data.as_ptr(), self.len) },
            None => &mut [],
        })
    }

    /// Resize the file to `len` bytes and map the new extent.
    pub fn truncate(&mut self, len: usize) -> Result<(), MemError> {
        if self.mode != MapMode::ReadWrite {
            return Err(MemError::Io {
                context: format!("truncating {}", self.path.display()),
                source: std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "file is mapped read-only",
                ),
            });
        }
        self.unmap()?;
        self.file.set_len(len as u64).map_err(|source| MemError::Io {
            context: format!("truncating {} to {len} bytes", self.path.display()),
            source,
        })?;
        self.map(len)
    }

    /// Flush written pages to the file.
    pub fn flush(&self) -> Result<(), MemError> {
        let Some(data) = self.data else {
            return Ok(());
        };
        // SAFETY: exactly our mapping.
        if unsafe { libc::msync(data.as_ptr() as _, self.len, libc::MS_SYNC) } != 0 {
            return Err(MemError::last_os_error(format!(
                "flushing {}",
                self.path.display()
            )));
        }
        Ok(())
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if let Err(e) = self.unmap() {
            warn!("{e}");
        }
        // The `File` closes itself; close errors are not reported by std.
    }
}

fn file_len(file: &File, path: &Path) -> Result<usize, MemError> {
    let len = file
        .metadata()
        .map_err(|source| MemError::Io {
            context: format!("reading metadata of {}", path.display()),
            source,
        })?
        .len();
    usize::try_from(len).map_err(|_| MemError::Config(format!("{} is too large to map", path.display())))
}
