//! Allocation errors and the per-thread error indicator.
//!
//! The allocator surface follows the C convention of the rest of the
//! configuration plane: fallible allocation returns NULL and records the
//! reason in a thread-local cell, which the caller can harvest to build a
//! structured error.

use core::fmt;
use std::cell::Cell;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    OutOfMemory,
    InvalidSize { size: u64 },
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "arena exhausted"),
            Self::InvalidSize { size } => write!(f, "unallocatable size {size}"),
        }
    }
}

/// Convenience result type for allocation-plane operations.
pub type MemResult<T = ()> = Result<T, MemError>;

thread_local! {
    static LAST_ERROR: Cell<Option<MemError>> = const { Cell::new(None) };
}

pub fn set_last_error(err: MemError) {
    LAST_ERROR.with(|c| c.set(Some(err)));
}

/// Read and clear the calling thread's last allocation error.
pub fn take_last_error() -> Option<MemError> {
    LAST_ERROR.with(|c| c.take())
}

pub fn last_error() -> Option<MemError> {
    LAST_ERROR.with(|c| c.get())
}
