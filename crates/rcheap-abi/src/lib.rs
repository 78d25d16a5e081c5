// All extern "C" exports take raw pointers from C callers and document their
// contract at module level.
#![allow(clippy::missing_safety_doc)]
//! # rcheap-abi
//!
//! `extern "C"` boundary for hosts that embed rcheap.
//!
//! ```text
//! C host -> rcheap_* entry (this crate) -> rcheap-core / rcheap-membrane
//! ```
//!
//! Every symbol carries an `rcheap_` prefix, so nothing here shadows the
//! platform C library and the exports are safe to link into test binaries.

#[macro_use]
mod macros;

pub mod aligned_abi;
pub mod hooks_abi;
pub mod pool_abi;
