//! # rcheap-membrane
//!
//! The boundary between a host environment and the rcheap core.
//!
//! - [`hooks`]: the replaceable table of raw allocate/reallocate/free,
//!   copy/move/fill and fatal primitives, with libc defaults.
//! - [`atomic`]: ordering-checked atomic primitives and the reference-count
//!   abstraction used by smart-pointer control blocks.
//! - [`config`]: environment-driven runtime settings.
//! - [`log`]: structured lifecycle records.
//!
//! Everything above this crate reaches raw memory only through [`hooks`].

pub mod atomic;
pub mod config;
pub mod hooks;
pub mod log;

pub use atomic::{AtomicCount, LocalCount, MemoryOrder, RefCounter};
pub use config::ReallocPolicy;
pub use hooks::{AllocHooks, DEFAULT_HOOKS, HookError, install_hooks};
pub use log::{LogLevel, LogRecord};
