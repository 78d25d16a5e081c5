//! Replaceable raw allocation hooks.
//!
//! A host may install its own [`AllocHooks`] table exactly once, before the
//! first allocation. Until then every call is served by [`DEFAULT_HOOKS`]
//! (the platform libc); after the default has served a call, installation is
//! refused so that blocks from two allocators are never mixed.
//!
//! The wrappers in this module are what the rest of rcheap calls. They add
//! the guarantees hosts should not have to re-implement: `free(null)` is a
//! no-op and `reallocate(null, n)` behaves as `allocate(n)`.

use std::ffi::{c_int, c_void};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use thiserror::Error;

use crate::log::{self, LogLevel, LogRecord};

/// `allocate(bytes) -> address | null`
pub type AllocateFn = unsafe extern "C" fn(bytes: usize) -> *mut c_void;
/// `reallocate(address | null, bytes) -> address | null`
pub type ReallocateFn = unsafe extern "C" fn(ptr: *mut c_void, bytes: usize) -> *mut c_void;
/// `free(address | null)`
pub type FreeFn = unsafe extern "C" fn(ptr: *mut c_void);
/// `copy(dst, src, bytes) -> dst`, regions must not overlap.
pub type CopyFn =
    unsafe extern "C" fn(dst: *mut c_void, src: *const c_void, bytes: usize) -> *mut c_void;
/// `move(dst, src, bytes) -> dst`, regions may overlap.
pub type MoveFn =
    unsafe extern "C" fn(dst: *mut c_void, src: *const c_void, bytes: usize) -> *mut c_void;
/// `fill(dst, byte, bytes) -> dst`
pub type FillFn = unsafe extern "C" fn(dst: *mut c_void, value: c_int, bytes: usize) -> *mut c_void;
/// `fatal(message, len)`, must terminate the process.
pub type FatalFn = unsafe extern "C" fn(msg: *const u8, len: usize) -> !;

/// Table of raw memory primitives.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AllocHooks {
    pub allocate: AllocateFn,
    pub reallocate: ReallocateFn,
    pub free: FreeFn,
    pub mem_copy: CopyFn,
    pub mem_move: MoveFn,
    pub mem_fill: FillFn,
    pub fatal: FatalFn,
}

unsafe extern "C" fn default_fatal(msg: *const u8, len: usize) -> ! {
    const PREFIX: &[u8] = b"rcheap: fatal: ";
    // SAFETY: writes to fd 2 from valid buffers; abort never returns.
    unsafe {
        libc::write(2, PREFIX.as_ptr().cast(), PREFIX.len());
        if !msg.is_null() && len > 0 {
            libc::write(2, msg.cast(), len);
        }
        libc::write(2, b"\n".as_ptr().cast(), 1);
        libc::abort()
    }
}

/// Hooks backed by the platform C library.
pub static DEFAULT_HOOKS: AllocHooks = AllocHooks {
    allocate: libc::malloc,
    reallocate: libc::realloc,
    free: libc::free,
    mem_copy: libc::memcpy,
    mem_move: libc::memmove,
    mem_fill: libc::memset,
    fatal: default_fatal,
};

static INSTALLED: AtomicPtr<AllocHooks> = AtomicPtr::new(ptr::null_mut());
static DEFAULT_IN_USE: AtomicBool = AtomicBool::new(false);

/// Why a hook table could not be installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HookError {
    #[error("allocation hooks were already installed")]
    AlreadyInstalled,
    #[error("default allocation hooks already served a call; installing now would mix allocators")]
    AlreadyInUse,
}

/// Install `hooks` as the process-wide table.
///
/// Succeeds at most once, and only before the default table has been used.
/// Installing concurrently with the first allocation is a race the caller
/// must avoid.
pub fn install_hooks(hooks: &'static AllocHooks) -> Result<(), HookError> {
    if DEFAULT_IN_USE.load(Ordering::Acquire) {
        log::emit(
            LogRecord::new(LogLevel::Error, "hooks", "install_rejected").with_outcome("in_use"),
        );
        return Err(HookError::AlreadyInUse);
    }
    let candidate = ptr::from_ref(hooks).cast_mut();
    match INSTALLED.compare_exchange(
        ptr::null_mut(),
        candidate,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => {
            log::emit(
                LogRecord::new(LogLevel::Info, "hooks", "installed").with_ptr(candidate.cast_const()),
            );
            Ok(())
        }
        Err(_) => {
            log::emit(
                LogRecord::new(LogLevel::Error, "hooks", "install_rejected")
                    .with_outcome("already_installed"),
            );
            Err(HookError::AlreadyInstalled)
        }
    }
}

/// Whether a custom table has been installed.
#[must_use]
pub fn hooks_installed() -> bool {
    !INSTALLED.load(Ordering::Acquire).is_null()
}

/// The active hook table.
#[inline]
#[must_use]
pub fn hooks() -> &'static AllocHooks {
    let installed = INSTALLED.load(Ordering::Acquire);
    if installed.is_null() {
        if !DEFAULT_IN_USE.load(Ordering::Relaxed) {
            DEFAULT_IN_USE.store(true, Ordering::Release);
        }
        &DEFAULT_HOOKS
    } else {
        // SAFETY: only `&'static AllocHooks` values are ever stored.
        unsafe { &*installed }
    }
}

/// Allocate `bytes` bytes. Returns null on failure.
#[inline]
#[must_use]
pub fn allocate(bytes: usize) -> *mut u8 {
    // SAFETY: the allocate hook accepts any size.
    unsafe { (hooks().allocate)(bytes).cast() }
}

/// Resize `ptr` to `bytes` bytes. Null `ptr` behaves as [`allocate`].
///
/// # Safety
/// `ptr` must be null or a live block from this hook table.
#[inline]
pub unsafe fn reallocate(ptr: *mut u8, bytes: usize) -> *mut u8 {
    if ptr.is_null() {
        return allocate(bytes);
    }
    // SAFETY: caller guarantees `ptr` came from this table.
    unsafe { (hooks().reallocate)(ptr.cast(), bytes).cast() }
}

/// Release `ptr`. Null is a no-op.
///
/// # Safety
/// `ptr` must be null or a live block from this hook table, freed once.
#[inline]
pub unsafe fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    // SAFETY: caller guarantees `ptr` came from this table.
    unsafe { (hooks().free)(ptr.cast()) }
}

/// Whether `[a, a + a_len)` and `[b, b + b_len)` share any byte.
#[must_use]
pub fn is_overlapping(a: *const u8, a_len: usize, b: *const u8, b_len: usize) -> bool {
    if a_len == 0 || b_len == 0 {
        return false;
    }
    let (a, b) = (a as usize, b as usize);
    a < b.saturating_add(b_len) && b < a.saturating_add(a_len)
}

/// Copy `bytes` bytes between non-overlapping regions.
///
/// # Safety
/// Both regions must be valid for `bytes` bytes and must not overlap.
#[inline]
pub unsafe fn copy(dst: *mut u8, src: *const u8, bytes: usize) -> *mut u8 {
    debug_assert!(
        !is_overlapping(dst, bytes, src, bytes),
        "copy on overlapping regions"
    );
    // SAFETY: forwarded caller contract.
    unsafe { (hooks().mem_copy)(dst.cast(), src.cast(), bytes).cast() }
}

/// Copy `bytes` bytes; the regions may overlap.
///
/// # Safety
/// Both regions must be valid for `bytes` bytes.
#[inline]
pub unsafe fn move_bytes(dst: *mut u8, src: *const u8, bytes: usize) -> *mut u8 {
    // SAFETY: forwarded caller contract.
    unsafe { (hooks().mem_move)(dst.cast(), src.cast(), bytes).cast() }
}

/// Set `bytes` bytes at `dst` to `value`.
///
/// # Safety
/// `dst` must be valid for `bytes` bytes.
#[inline]
pub unsafe fn fill(dst: *mut u8, value: u8, bytes: usize) -> *mut u8 {
    // SAFETY: forwarded caller contract.
    unsafe { (hooks().mem_fill)(dst.cast(), c_int::from(value), bytes).cast() }
}

/// Log `msg` and terminate through the fatal hook.
#[cold]
pub fn fatal(msg: &str) -> ! {
    log::emit(LogRecord::new(LogLevel::Fatal, "hooks", "fatal").with_details(msg));
    // SAFETY: the message buffer is valid for its length.
    unsafe { (hooks().fatal)(msg.as_ptr(), msg.len()) }
}
