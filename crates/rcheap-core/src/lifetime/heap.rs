//! Heap objects and typed buffers on top of the aligned allocator.

use std::mem::{align_of, size_of};
use std::ptr::{self, NonNull};

use rcheap_membrane::hooks;
use rcheap_membrane::log::{self, LogLevel, LogRecord};

use super::{Descriptor, InitState, copy_slice, destruct_slice, destruct_with, initialize_slice};
use crate::aligned::{aligned_allocate, aligned_free, aligned_reallocate};
use crate::error::AllocError;

// Zero-sized requests still get a distinct block so the address can be freed.
#[inline]
fn block_bytes<T>(len: usize) -> Option<usize> {
    size_of::<T>().checked_mul(len).map(|n| n.max(1))
}

fn oom(err: AllocError) -> ! {
    hooks::fatal(&format!("out of memory: {err}"))
}

/// Move `value` into a fresh aligned heap block.
pub fn try_new_object<T>(value: T) -> Result<NonNull<T>, AllocError> {
    let align = align_of::<T>();
    let bytes = size_of::<T>().max(1);
    let Some(slot) = NonNull::new(aligned_allocate(bytes, align).cast::<T>()) else {
        log::emit(
            LogRecord::new(LogLevel::Warn, "lifetime", "new_object_failed")
                .with_size(bytes)
                .with_align(align)
                .with_outcome("alloc_error"),
        );
        return Err(AllocError::new(bytes, align));
    };
    // SAFETY: fresh block, valid and aligned for one `T`.
    unsafe { slot.as_ptr().write(value) };
    Ok(slot)
}

/// Like [`try_new_object`], terminating through the fatal hook on OOM.
pub fn new_object<T>(value: T) -> NonNull<T> {
    try_new_object(value).unwrap_or_else(|err| oom(err))
}

/// Destroy and free an object from [`new_object`]. Null is a no-op.
///
/// # Safety
/// `obj` is null or came from [`new_object`]/[`try_new_object`] for the same
/// `T` and has not been deleted.
pub unsafe fn delete_object<T>(obj: *mut T) {
    // SAFETY: forwarded caller contract.
    unsafe { delete_object_with(obj, &Descriptor::plain()) }
}

/// [`delete_object`] with an explicit descriptor.
///
/// # Safety
/// See [`delete_object`].
pub unsafe fn delete_object_with<T>(obj: *mut T, desc: &Descriptor<T>) {
    if obj.is_null() {
        return;
    }
    // SAFETY: forwarded caller contract.
    unsafe {
        destruct_with(obj, desc);
        aligned_free(obj.cast(), align_of::<T>());
    }
}

/// Resize a typed buffer of `len` live elements to `new_len`.
///
/// Dropped tail elements are destructed, new ones are written with
/// `T::INIT`. `new_len == 0` frees the buffer and returns null. On error
/// the old buffer is still valid and holds `min(len, new_len)` live
/// elements.
///
/// # Safety
/// `buf` is null (with `len == 0`) or a buffer from this module holding
/// `len` live elements.
pub unsafe fn resize_buffer<T: InitState>(
    buf: *mut T,
    len: usize,
    new_len: usize,
) -> Result<*mut T, AllocError> {
    // SAFETY: forwarded caller contract.
    unsafe { resize_buffer_with(buf, len, new_len, &Descriptor::plain()) }
}

/// [`resize_buffer`] with an explicit descriptor; `post_move` runs on every
/// surviving element when the buffer relocates.
///
/// # Safety
/// See [`resize_buffer`].
pub unsafe fn resize_buffer_with<T: InitState>(
    buf: *mut T,
    len: usize,
    new_len: usize,
    desc: &Descriptor<T>,
) -> Result<*mut T, AllocError> {
    debug_assert!(!buf.is_null() || len == 0, "null buffer with {len} live elements");
    let align = align_of::<T>();
    if new_len == len && !buf.is_null() {
        return Ok(buf);
    }
    let Some(bytes) = block_bytes::<T>(new_len) else {
        return Err(AllocError::new(usize::MAX, align));
    };
    if new_len < len {
        // SAFETY: elements `new_len..len` are live.
        unsafe { destruct_slice(buf.add(new_len), len - new_len, desc) };
    }
    if new_len == 0 {
        // SAFETY: forwarded caller contract.
        unsafe { aligned_free(buf.cast(), align) };
        return Ok(ptr::null_mut());
    }

    // SAFETY: `buf` is null or a live block allocated with `align`.
    let grown = unsafe { aligned_reallocate(buf.cast(), bytes, align, true) }.cast::<T>();
    if grown.is_null() {
        return Err(AllocError::new(bytes, align));
    }
    let kept = len.min(new_len);
    if let Some(post_move) = desc.post_move.filter(|_| grown != buf) {
        for i in 0..kept {
            // SAFETY: the first `kept` elements were relocated bitwise.
            post_move(unsafe { &mut *grown.add(i) });
        }
    }
    if new_len > len {
        // SAFETY: the block holds `new_len` slots.
        unsafe { initialize_slice(grown.add(len), new_len - len) };
    }
    Ok(grown)
}

/// Clone `src` into a new buffer. Empty input yields null.
pub fn dup_slice<T: Clone>(src: &[T]) -> Result<*mut T, AllocError> {
    if src.is_empty() {
        return Ok(ptr::null_mut());
    }
    let align = align_of::<T>();
    let Some(bytes) = block_bytes::<T>(src.len()) else {
        return Err(AllocError::new(usize::MAX, align));
    };
    let buf = aligned_allocate(bytes, align).cast::<T>();
    if buf.is_null() {
        return Err(AllocError::new(bytes, align));
    }
    // SAFETY: fresh block with room for `src.len()` elements.
    unsafe { copy_slice(src, buf, &Descriptor::plain()) };
    Ok(buf)
}

/// Destruct `len` elements and free the buffer. Null is a no-op.
///
/// # Safety
/// `buf` is null or a buffer from this module holding `len` live elements.
pub unsafe fn free_buffer<T>(buf: *mut T, len: usize) {
    if buf.is_null() {
        return;
    }
    // SAFETY: forwarded caller contract.
    unsafe {
        destruct_slice(buf, len, &Descriptor::plain());
        aligned_free(buf.cast(), align_of::<T>());
    }
}
