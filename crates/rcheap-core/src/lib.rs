//! # rcheap-core
//!
//! Manual memory management without a tracing collector: aligned heap
//! blocks, an explicit object lifetime protocol, unique/shared/weak
//! reference-counted handles and autorelease pools.
//!
//! All raw memory comes from the hook table in `rcheap-membrane`. Unsafe
//! code is denied at the crate level and allowed per module where raw
//! memory is handled.

#![deny(unsafe_code)]

pub mod aligned;
pub mod error;
pub mod lifetime;
pub mod pool;
pub mod rc;

pub use aligned::{
    AlignedStats, aligned_allocate, aligned_free, aligned_reallocate, aligned_reallocate_with,
    aligned_request, aligned_stats, aligned_usable_size,
};
pub use error::{AllocError, PoolError};
pub use lifetime::{Descriptor, InitState, Lifecycle};
pub use pool::{PoolBridge, PoolGuard, PoolHandle, PoolStack, autoreleasepool, set_pool_bridge};
pub use rc::{Shared, Unique, Weak};
