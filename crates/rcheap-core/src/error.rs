//! Error types for fallible core operations.

use thiserror::Error;

/// A heap allocation through the hook table returned null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[error("allocation of {size} bytes with alignment {align} failed")]
pub struct AllocError {
    pub size: usize,
    pub align: usize,
}

impl AllocError {
    #[must_use]
    pub const fn new(size: usize, align: usize) -> Self {
        Self { size, align }
    }
}

/// Misuse of an autorelease pool stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum PoolError {
    /// No frame is active.
    #[error("no autorelease pool is active")]
    Empty,
    /// The handle does not name the topmost frame.
    #[error("autorelease pool {expected} popped while pool {top} is on top")]
    Mismatch { expected: u64, top: u64 },
}
