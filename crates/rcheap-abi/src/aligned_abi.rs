//! ABI for aligned blocks. The same `alignment` must be passed to every
//! call on one block.

use std::ffi::{c_int, c_void};

use rcheap_core::aligned;

abi_fn! {
    /// Null when `alignment` is not a power of two or allocation fails.
    fn rcheap_aligned_allocate(size: usize, alignment: usize) -> *mut c_void {
        aligned::aligned_allocate(size, alignment).cast()
    }
}

abi_fn! {
    /// Resize a block; contents are copied on a move when `preserve` is
    /// non-zero. On failure null is returned and `ptr` stays valid.
    fn rcheap_aligned_reallocate(
        ptr: *mut c_void,
        size: usize,
        alignment: usize,
        preserve: c_int,
    ) -> *mut c_void {
        aligned::aligned_reallocate(ptr.cast(), size, alignment, preserve != 0).cast()
    }
}

abi_fn! {
    fn rcheap_aligned_free(ptr: *mut c_void, alignment: usize) {
        aligned::aligned_free(ptr.cast(), alignment);
    }
}

abi_fn! {
    /// Bytes usable from `ptr`, or 0 when unknown (null or alignment 1).
    fn rcheap_aligned_usable_size(ptr: *mut c_void, alignment: usize) -> usize {
        aligned::aligned_usable_size(ptr.cast(), alignment).unwrap_or(0)
    }
}
