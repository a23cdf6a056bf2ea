use std::io;

/// Everything that can go wrong while reserving, handing out or mapping
/// memory. The usage profiler never produces one of these.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum MemError {
    /// The arena (or the platform heap) cannot satisfy the request.
    #[error("out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    /// The OS refused to map the page extent.
    #[error("could not map {len} bytes of pages: {source}")]
    MapFailed { len: usize, source: io::Error },

    /// A size of zero asks us to use whatever huge pages are free, but there
    /// are none.
    #[error("no free huge pages are available")]
    NoHugePageCapacity,

    /// `free()`/`realloc()` on an address that is inside the arena but is not
    /// the start of a live allocation.
    #[error("pointer {addr:#x} does not refer to a live allocation")]
    InvalidPointer { addr: usize },

    /// The page pool can only be switched on once per process.
    #[error("the page pool is already enabled")]
    PagePoolAlreadyEnabled,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl MemError {
    /// Wrap the current `errno` with some context about what we were doing.
    pub(crate) fn last_os_error(context: impl Into<String>) -> Self {
        Self::Io {
            context: context.into(),
            source: io::Error::last_os_error(),
        }
    }
}
