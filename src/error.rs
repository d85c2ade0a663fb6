// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error kinds surfaced by the memory core (design §7). Every public
// operation returns `Result<T, MemError>` or `Option<T>` — nothing in this
// crate panics outside of `#[cfg(test)]` or a genuine invariant violation.

use std::fmt;
use std::io;

/// A single error type for every fallible operation in the memory core.
///
/// Mirrors §7's table: one variant per row, each naming the statistics
/// counter or return convention a caller should expect alongside it.
#[derive(Debug)]
pub enum MemError {
    /// `pool.allocate_slot()` found `nInit >= blockCount` and the free-list
    /// was empty. `stat.n_pool_full` has already been incremented.
    AllocationExhausted,
    /// Requested payload size exceeds what a single slot can hold.
    /// `stat.n_too_large_for_pool` has already been incremented.
    RequestTooLarge { requested: usize, max: usize },
    /// A platform mmap/shm_open/ftruncate/memfd_create call failed.
    BackendFailure(io::Error),
    /// `MBQueue::push`/`push_align` would exceed `max_length`.
    QueueFull,
    /// `MBQueue::peek` while `in_pre_buf` and `length() < pre_buf`.
    PreBuffering,
    /// Import segment/block table limits reached (160 blocks, 16 segments).
    SegmentCapacityExceeded,
    /// Import.get referenced an unregistered memfd segment, or requested
    /// a writable mapping of a segment attached read-only.
    ProtocolViolation(&'static str),
    /// A constructor argument failed basic sanity checks (empty name,
    /// zero size, size over `MAX_SHM_SIZE`, misaligned attach size, ...).
    InvalidArgument(&'static str),
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemError::AllocationExhausted => write!(f, "memory pool exhausted"),
            MemError::RequestTooLarge { requested, max } => {
                write!(f, "requested size {requested} exceeds pool slot capacity {max}")
            }
            MemError::BackendFailure(e) => write!(f, "shared memory backend failure: {e}"),
            MemError::QueueFull => write!(f, "push would exceed queue max_length"),
            MemError::PreBuffering => write!(f, "queue is prebuffering"),
            MemError::SegmentCapacityExceeded => write!(f, "import block/segment table is full"),
            MemError::ProtocolViolation(msg) => write!(f, "import protocol violation: {msg}"),
            MemError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
        }
    }
}

impl std::error::Error for MemError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MemError::BackendFailure(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for MemError {
    fn from(e: io::Error) -> Self {
        MemError::BackendFailure(e)
    }
}

impl From<MemError> for io::Error {
    fn from(e: MemError) -> Self {
        match e {
            MemError::BackendFailure(inner) => inner,
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MemError>;
