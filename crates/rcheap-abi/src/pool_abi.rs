//! ABI for the calling thread's autorelease pool stack and the foreign
//! runtime bridge.
//!
//! Pool handles cross the boundary as their `u64` id. Popping anything but
//! the topmost pool is fatal.

use std::ffi::{c_int, c_void};

use rcheap_core::lifetime::{delete_object, new_object};
use rcheap_core::pool::{self, PoolBridge, PoolHandle};

/// Release callback as seen from C.
pub type CReleaseFn = unsafe extern "C" fn(item: *mut c_void);
pub type CPoolPushFn = unsafe extern "C" fn() -> *mut c_void;
pub type CPoolPopFn = unsafe extern "C" fn(ctx: *mut c_void);

struct ForeignRelease {
    item: *mut c_void,
    release: CReleaseFn,
}

unsafe fn run_foreign_release(entry: *mut c_void) {
    let entry = entry.cast::<ForeignRelease>();
    // SAFETY: registered by `rcheap_pool_register` from `new_object`.
    unsafe {
        let ForeignRelease { item, release } = entry.read();
        delete_object(entry);
        release(item);
    }
}

unsafe extern "C" fn noop_push() -> *mut c_void {
    std::ptr::null_mut()
}

unsafe extern "C" fn noop_pop(_ctx: *mut c_void) {}

abi_fn! {
    fn rcheap_pool_push() -> u64 {
        pool::push().id()
    }
}

abi_fn! {
    /// Release the pool's items newest first. Terminates the process when
    /// `id` is not the topmost pool.
    fn rcheap_pool_pop(id: u64) {
        pool::pop(PoolHandle::from_id(id));
    }
}

abi_fn! {
    /// Queue `release(item)` on the topmost pool. Returns 0, or `ENOENT`
    /// when no pool is open (the item is not released).
    fn rcheap_pool_register(item: *mut c_void, release: CReleaseFn) -> c_int {
        if !pool::has_active_pool() {
            return libc::ENOENT;
        }
        let entry = new_object(ForeignRelease { item, release });
        match pool::register_for_release(entry.as_ptr().cast(), run_foreign_release) {
            Ok(()) => 0,
            Err(_) => {
                delete_object(entry.as_ptr());
                libc::ENOENT
            }
        }
    }
}

abi_fn! {
    fn rcheap_pool_depth() -> usize {
        pool::depth()
    }
}

abi_fn! {
    /// Install the bridge; passing null for both removes it. A single null
    /// callback is replaced by a no-op.
    fn rcheap_set_pool_bridge(on_push: Option<CPoolPushFn>, on_pop: Option<CPoolPopFn>) {
        let bridge = match (on_push, on_pop) {
            (None, None) => None,
            (push, pop) => Some(PoolBridge {
                on_push: push.unwrap_or(noop_push),
                on_pop: pop.unwrap_or(noop_pop),
            }),
        };
        pool::set_pool_bridge(bridge);
    }
}
