//! ABI for the raw allocation hooks.
//!
//! `rcheap_allocate`/`rcheap_reallocate` return null on failure,
//! `rcheap_free(NULL)` is a no-op and `rcheap_fatal` never returns.
//! A host replaces the whole table once, before the first allocation, with
//! `rcheap_install_hooks`.

use std::ffi::{c_int, c_void};

use rcheap_membrane::hooks::{self, AllocHooks, HookError};

abi_fn! {
    fn rcheap_allocate(bytes: usize) -> *mut c_void {
        hooks::allocate(bytes).cast()
    }
}

abi_fn! {
    /// Null `ptr` behaves as `rcheap_allocate`.
    fn rcheap_reallocate(ptr: *mut c_void, bytes: usize) -> *mut c_void {
        hooks::reallocate(ptr.cast(), bytes).cast()
    }
}

abi_fn! {
    fn rcheap_free(ptr: *mut c_void) {
        hooks::free(ptr.cast());
    }
}

abi_fn! {
    /// `memcpy` semantics; regions must not overlap.
    fn rcheap_copy(dst: *mut c_void, src: *const c_void, bytes: usize) -> *mut c_void {
        hooks::copy(dst.cast(), src.cast(), bytes).cast()
    }
}

abi_fn! {
    /// `memmove` semantics.
    fn rcheap_move(dst: *mut c_void, src: *const c_void, bytes: usize) -> *mut c_void {
        hooks::move_bytes(dst.cast(), src.cast(), bytes).cast()
    }
}

abi_fn! {
    /// `memset` semantics; only the low byte of `value` is used.
    fn rcheap_fill(dst: *mut c_void, value: c_int, bytes: usize) -> *mut c_void {
        hooks::fill(dst.cast(), value as u8, bytes).cast()
    }
}

abi_fn! {
    fn rcheap_fatal(msg: *const u8, len: usize) -> ! {
        let text = if msg.is_null() {
            ""
        } else {
            std::str::from_utf8(std::slice::from_raw_parts(msg, len))
                .unwrap_or("fatal error (message is not UTF-8)")
        };
        hooks::fatal(text)
    }
}

/// Map an install result to the C status code.
#[must_use]
pub fn install_status(result: Result<(), HookError>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(HookError::AlreadyInstalled) => libc::EEXIST,
        Err(HookError::AlreadyInUse) => libc::EBUSY,
    }
}

abi_fn! {
    /// Copy `*table` and install it process-wide.
    ///
    /// Returns 0 on success, `EINVAL` for null, `EEXIST` when a table was
    /// already installed and `EBUSY` when the defaults already served a
    /// call.
    fn rcheap_install_hooks(table: *const AllocHooks) -> c_int {
        if table.is_null() {
            return libc::EINVAL;
        }
        let owned: &'static AllocHooks = Box::leak(Box::new(*table));
        let status = install_status(hooks::install_hooks(owned));
        if status != 0 {
            // SAFETY: rejected, so nothing else holds the leaked table.
            drop(Box::from_raw(std::ptr::from_ref(owned).cast_mut()));
        }
        status
    }
}

abi_fn! {
    /// 1 when a host table is installed, 0 while the defaults are active.
    fn rcheap_hooks_installed() -> c_int {
        c_int::from(hooks::hooks_installed())
    }
}
