//! Storage for succinct bit vectors, optionally served from a pool of huge
//! pages, together with a profiler that keeps a timeline of how much of it is
//! in use.
//!
//! Everything hangs off a [`MemoryManager`]: build one per process (or per
//! test), share it by reference, and let it grow and free vectors through
//! [`MemoryManager::resize()`] and [`MemoryManager::clear()`].
//!
//! ```
//! use bitmem::{MemoryManager, RawBitVec};
//!
//! let manager = MemoryManager::new();
//! manager.monitor().start();
//!
//! let mut v = RawBitVec::new();
//! manager.resize(&mut v, 1000).unwrap();
//! v.set(999, true);
//! assert_eq!(v.rank(1000), 1);
//! assert_eq!(manager.monitor().current_usage(), 128);
//! manager.clear(&mut v).unwrap();
//!
//! manager.monitor().stop();
//! let report = manager.monitor().report();
//! assert!(report.events.iter().all(|e| e.samples.last().unwrap().usage == 0));
//! ```

pub mod alloc;
pub mod config;
pub mod error;
pub mod monitor;
pub mod os;
pub mod serialize;
pub mod util;

pub use alloc::{
    bitvec::{BitStorage, RawBitVec},
    manager::MemoryManager,
    page::{ArenaStats, PageAllocator},
};
pub use config::{ByteSize, MemoryConfig};
pub use error::MemError;
pub use monitor::{report::UsageReport, EventGuard, UsageProfiler};
