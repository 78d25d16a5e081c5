//! Control block shared by one object's strong and weak handles.
//!
//! Layout: two counters, a payload pointer that is null once the object is
//! gone, the object's destroy callback and, for objects constructed by a
//! handle, inline storage for the object itself.
//!
//! Strong handles collectively hold one implicit weak reference. The block
//! is freed when the weak count reaches zero, so it outlives the payload for
//! as long as weak observers exist.

use std::ffi::c_void;
use std::mem::{MaybeUninit, align_of, size_of};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use rcheap_membrane::atomic::{self, MemoryOrder, RefCounter};
use rcheap_membrane::log::{self, LogLevel, LogRecord};

use crate::aligned::{aligned_allocate, aligned_free};
use crate::error::AllocError;
use crate::lifetime::{Descriptor, delete_object};
use crate::pool;

pub(crate) struct RcBlock<T, C> {
    strong: C,
    weak: C,
    implicit_weak: AtomicBool,
    unique: AtomicBool,
    payload: AtomicPtr<T>,
    object: *mut T,
    destroy: unsafe fn(*mut T),
    autorelease: bool,
    external: bool,
    storage: MaybeUninit<T>,
}

impl<T, C: RefCounter> RcBlock<T, C> {
    fn allocate_empty(
        desc: &Descriptor<T>,
        unique: bool,
        external: bool,
    ) -> Result<NonNull<Self>, AllocError> {
        let size = size_of::<Self>();
        let align = align_of::<Self>();
        let Some(block) = NonNull::new(aligned_allocate(size, align).cast::<Self>()) else {
            log::emit(
                LogRecord::new(LogLevel::Warn, "rc", "block_alloc_failed")
                    .with_size(size)
                    .with_align(align)
                    .with_outcome("alloc_error"),
            );
            return Err(AllocError::new(size, align));
        };
        // SAFETY: fresh block, valid and aligned for `Self`.
        unsafe {
            block.as_ptr().write(Self {
                strong: C::new(1),
                weak: C::new(1),
                implicit_weak: AtomicBool::new(true),
                unique: AtomicBool::new(unique),
                payload: AtomicPtr::new(ptr::null_mut()),
                object: ptr::null_mut(),
                destroy: desc.destroy,
                autorelease: desc.autorelease,
                external,
                storage: MaybeUninit::uninit(),
            });
        }
        Ok(block)
    }

    /// New block owning `value` inline, with one strong reference.
    pub(crate) fn with_value(
        value: T,
        desc: &Descriptor<T>,
        unique: bool,
    ) -> Result<NonNull<Self>, AllocError> {
        let block = Self::allocate_empty(desc, unique, false)?;
        // SAFETY: the block is fresh and not yet shared.
        unsafe {
            let raw = block.as_ptr();
            let object = (&raw mut (*raw).storage).cast::<T>();
            object.write(value);
            (*raw).object = object;
            atomic::store_ptr(&(*raw).payload, object, MemoryOrder::Release);
        }
        Ok(block)
    }

    /// New block adopting a heap object from `new_object`.
    ///
    /// # Safety
    /// `object` is a live object from [`crate::lifetime::new_object`] that
    /// nothing else will free.
    pub(crate) unsafe fn adopt(
        object: NonNull<T>,
        desc: &Descriptor<T>,
        unique: bool,
    ) -> Result<NonNull<Self>, AllocError> {
        let block = Self::allocate_empty(desc, unique, true)?;
        // SAFETY: the block is fresh and not yet shared.
        unsafe {
            let raw = block.as_ptr();
            (*raw).object = object.as_ptr();
            atomic::store_ptr(&(*raw).payload, object.as_ptr(), MemoryOrder::Release);
        }
        Ok(block)
    }

    #[inline]
    pub(crate) fn payload(&self, order: MemoryOrder) -> *mut T {
        atomic::load_ptr(&self.payload, order)
    }

    #[inline]
    pub(crate) fn strong_count(&self) -> u32 {
        self.strong.get()
    }

    /// Weak references excluding the one held on behalf of strong handles.
    #[inline]
    pub(crate) fn weak_count(&self) -> u32 {
        let raw = self.weak.get();
        if self.implicit_weak.load(Ordering::Acquire) {
            raw.saturating_sub(1)
        } else {
            raw
        }
    }

    #[inline]
    pub(crate) fn retain_strong(&self) {
        self.strong.increment();
    }

    #[inline]
    pub(crate) fn retain_weak(&self) {
        self.weak.increment();
    }

    /// Strong reference from a weak one, unless the object is gone or held
    /// by a unique handle.
    #[inline]
    pub(crate) fn try_upgrade(&self) -> bool {
        !self.unique.load(Ordering::Acquire) && self.strong.increment_if_nonzero()
    }

    #[inline]
    pub(crate) fn release_unique(&self) {
        self.unique.store(false, Ordering::Release);
    }

    /// Drop one strong reference. The caller that takes the count to zero
    /// retires the payload.
    ///
    /// # Safety
    /// `this` is live and the caller owns one strong reference.
    pub(crate) unsafe fn release_strong(this: NonNull<Self>) {
        // SAFETY: the caller's strong reference keeps the block alive.
        let inner = unsafe { this.as_ref() };
        match inner.strong.decrement() {
            Some(1) => {
                inner.strong.acquire_fence();
                // SAFETY: this call observed the 1 -> 0 transition.
                unsafe { Self::retire(this) };
            }
            Some(_) => {}
            None => {
                debug_assert!(false, "strong count underflow on {:p}", this.as_ptr());
                log::emit(
                    LogRecord::new(LogLevel::Error, "rc", "strong_underflow")
                        .with_ptr(this.as_ptr().cast_const())
                        .with_outcome("clamped"),
                );
            }
        }
    }

    /// Null the payload, then destroy it now or hand it to the current
    /// thread's autorelease pool.
    unsafe fn retire(this: NonNull<Self>) {
        // SAFETY: the implicit weak reference keeps the block alive.
        let inner = unsafe { this.as_ref() };
        let object = atomic::swap_ptr(&inner.payload, ptr::null_mut(), MemoryOrder::AcqRel);
        debug_assert_eq!(object, inner.object);
        if inner.autorelease
            && pool::register_for_release(this.as_ptr().cast(), release_deferred::<T, C>).is_ok()
        {
            if log::enabled(LogLevel::Debug) {
                log::emit(
                    LogRecord::new(LogLevel::Debug, "rc", "destroy_deferred")
                        .with_ptr(object.cast_const())
                        .with_outcome("pooled"),
                );
            }
            return;
        }
        // SAFETY: the payload was retired exactly once above.
        unsafe { Self::finish(this) };
    }

    /// Run the destroy callback and drop the implicit weak reference.
    unsafe fn finish(this: NonNull<Self>) {
        // SAFETY: the implicit weak reference keeps the block alive.
        let inner = unsafe { this.as_ref() };
        let object = inner.object;
        // SAFETY: the payload is live and retired, so this is its only
        // destruction.
        unsafe {
            (inner.destroy)(object);
            if inner.external {
                aligned_free(object.cast(), align_of::<T>());
            }
        }
        if log::enabled(LogLevel::Trace) {
            log::emit(
                LogRecord::new(LogLevel::Trace, "rc", "payload_destroyed")
                    .with_ptr(object.cast_const())
                    .with_outcome(if inner.external { "adopted" } else { "inline" }),
            );
        }
        inner.implicit_weak.store(false, Ordering::Release);
        // SAFETY: releases the implicit weak reference.
        unsafe { Self::release_weak(this) };
    }

    /// Drop one weak reference, freeing the block on the last one.
    ///
    /// # Safety
    /// `this` is live and the caller owns one weak reference.
    pub(crate) unsafe fn release_weak(this: NonNull<Self>) {
        // SAFETY: the caller's weak reference keeps the block alive.
        let inner = unsafe { this.as_ref() };
        match inner.weak.decrement() {
            Some(1) => {
                inner.weak.acquire_fence();
                // SAFETY: no handle references the block any more; the
                // payload storage was already destroyed.
                unsafe { delete_object(this.as_ptr()) };
            }
            Some(_) => {}
            None => {
                debug_assert!(false, "weak count underflow on {:p}", this.as_ptr());
                log::emit(
                    LogRecord::new(LogLevel::Error, "rc", "weak_underflow")
                        .with_ptr(this.as_ptr().cast_const())
                        .with_outcome("clamped"),
                );
            }
        }
    }
}

unsafe fn release_deferred<T, C: RefCounter>(item: *mut c_void) {
    if let Some(block) = NonNull::new(item.cast::<RcBlock<T, C>>()) {
        // SAFETY: registered by `retire`, which skipped `finish`.
        unsafe { RcBlock::finish(block) };
    }
}
