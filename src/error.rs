//! Error types for the page allocator core.
//!
//! Host-syscall failures keep their `errno` via `std::io::Error`; invariant
//! violations (malformed ranges, 0-refcount `incref`, ...) are programming
//! errors and panic instead of flowing through `Result`, per the spec.

use std::ops::Range;

/// The library-wide result alias.
pub type Result<T> = std::result::Result<T, MemoryFileError>;

/// Failure modes a [`crate::MemoryFile`] can report to its caller.
#[derive(Debug, thiserror::Error)]
pub enum MemoryFileError {
    /// The backing file cannot be extended further: the total chunk count
    /// would exceed `i64::MAX / CHUNK_SIZE`.
    #[error("out of space: cannot extend backing file past {attempted_chunks} chunks")]
    OutOfSpace { attempted_chunks: u64 },

    /// A host call (`truncate`, `mmap`, `fallocate`, `fstat`, `mincore`, ...)
    /// failed. The originating call is named for diagnostics.
    #[error("host syscall `{call}` failed: {source}")]
    HostSyscall {
        call: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// `map_internal` was called with `AccessType::Execute`.
    #[error("access denied: executable mappings are not permitted")]
    InvalidAccess,

    /// The caller-supplied `reader` returned fewer bytes than requested.
    /// The range actually filled (and returned to the caller) is recorded
    /// alongside the read error, if any.
    #[error("short read: only {got} of {wanted} bytes available for {range:?}")]
    ShortRead {
        range: Range<u64>,
        wanted: u64,
        got: u64,
        #[source]
        source: Option<std::io::Error>,
    },
}

impl MemoryFileError {
    /// Wraps a host syscall failure, tagging it with the syscall name for
    /// the error message.
    pub(crate) fn host(call: &'static str, source: std::io::Error) -> Self {
        MemoryFileError::HostSyscall { call, source }
    }

    /// Returns the last OS error, tagged with `call`, as a `Result::Err`.
    pub(crate) fn last_os_error<T>(call: &'static str) -> Result<T> {
        Err(Self::host(call, std::io::Error::last_os_error()))
    }
}
