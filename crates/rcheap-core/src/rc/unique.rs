use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

use rcheap_membrane::atomic::{AtomicCount, MemoryOrder, RefCounter};

use super::block::RcBlock;
use super::{Weak, oom};
use crate::error::AllocError;
use crate::lifetime::{Descriptor, InitState, Lifecycle};

/// Sole strong owner of a heap object.
///
/// Moving a `Unique` transfers the block; `take` does the same explicitly and
/// leaves a null handle behind. Dropping a non-null handle destroys the
/// object. Weak observers created with [`Unique::downgrade`] see it vanish
/// but can never upgrade while it is uniquely owned.
pub struct Unique<T, C: RefCounter = AtomicCount> {
    block: Option<NonNull<RcBlock<T, C>>>,
    _marker: PhantomData<RcBlock<T, C>>,
}

// SAFETY: a `Unique` owns its `T`; the counters are only shared with weak
// handles, which require `C: Sync`.
unsafe impl<T: Send + Sync, C: RefCounter + Send + Sync> Send for Unique<T, C> {}
// SAFETY: `&Unique` only hands out `&T`.
unsafe impl<T: Send + Sync, C: RefCounter + Send + Sync> Sync for Unique<T, C> {}

impl<T, C: RefCounter> Unique<T, C> {
    /// A handle that owns nothing.
    #[must_use]
    pub const fn null() -> Self {
        Self {
            block: None,
            _marker: PhantomData,
        }
    }

    /// Box `value`, terminating through the fatal hook on OOM.
    pub fn new(value: T) -> Self {
        Self::try_new(value).unwrap_or_else(|err| oom(err))
    }

    pub fn try_new(value: T) -> Result<Self, AllocError> {
        Self::try_new_with(value, &Descriptor::plain())
    }

    pub fn new_with(value: T, desc: &Descriptor<T>) -> Self {
        Self::try_new_with(value, desc).unwrap_or_else(|err| oom(err))
    }

    /// Box `value`, destroying it later through `desc`.
    pub fn try_new_with(value: T, desc: &Descriptor<T>) -> Result<Self, AllocError> {
        RcBlock::with_value(value, desc, true).map(Self::from_block)
    }

    /// Box `value` using its [`Lifecycle`] overrides.
    pub fn new_managed(value: T) -> Self
    where
        T: Lifecycle,
    {
        Self::new_with(value, &Descriptor::of())
    }

    /// Take ownership of an object from
    /// [`new_object`](crate::lifetime::new_object). Null yields a null
    /// handle.
    ///
    /// # Safety
    /// `object` is null or a live object from `new_object` that nothing else
    /// frees.
    pub unsafe fn from_object(object: *mut T) -> Self {
        let Some(object) = NonNull::new(object) else {
            return Self::null();
        };
        // SAFETY: forwarded caller contract.
        match unsafe { RcBlock::adopt(object, &Descriptor::plain(), true) } {
            Ok(block) => Self::from_block(block),
            Err(err) => oom(err),
        }
    }

    fn from_block(block: NonNull<RcBlock<T, C>>) -> Self {
        Self {
            block: Some(block),
            _marker: PhantomData,
        }
    }

    #[inline]
    fn inner(&self) -> Option<&RcBlock<T, C>> {
        // SAFETY: a non-null handle keeps its block alive.
        self.block.map(|b| unsafe { &*b.as_ptr() })
    }

    #[inline]
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.block.is_none()
    }

    /// The object, read with a relaxed load.
    #[inline]
    #[must_use]
    pub fn get(&self) -> Option<&T> {
        let p = self.inner()?.payload(MemoryOrder::Relaxed);
        // SAFETY: the payload lives while this handle does.
        unsafe { p.as_ref() }
    }

    /// The object, read with an acquire load.
    #[inline]
    #[must_use]
    pub fn get_atomic(&self) -> Option<&T> {
        let p = self.inner()?.payload(MemoryOrder::Acquire);
        // SAFETY: the payload lives while this handle does.
        unsafe { p.as_ref() }
    }

    #[inline]
    pub fn get_mut(&mut self) -> Option<&mut T> {
        let p = self.inner()?.payload(MemoryOrder::Relaxed);
        // SAFETY: unique ownership; weak handles only expose raw pointers.
        unsafe { p.as_mut() }
    }

    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *const T {
        self.inner()
            .map_or(ptr::null(), |b| b.payload(MemoryOrder::Relaxed).cast_const())
    }

    /// Destroy the object now and become null.
    pub fn reset(&mut self) {
        if let Some(block) = self.block.take() {
            // SAFETY: this handle owned the only strong reference.
            unsafe { RcBlock::release_strong(block) };
        }
    }

    /// Move ownership out, leaving `self` null.
    #[must_use]
    pub fn take(&mut self) -> Self {
        Self {
            block: self.block.take(),
            _marker: PhantomData,
        }
    }

    /// 1 while the handle owns an object, 0 when null.
    #[must_use]
    pub fn strong_count(&self) -> u32 {
        self.inner().map_or(0, RcBlock::strong_count)
    }

    #[must_use]
    pub fn weak_count(&self) -> u32 {
        self.inner().map_or(0, RcBlock::weak_count)
    }

    /// A weak observer of this object. Null handles give null observers.
    #[must_use]
    pub fn downgrade(&self) -> Weak<T, C> {
        match self.block {
            Some(block) => {
                // SAFETY: a non-null handle keeps its block alive.
                unsafe { block.as_ref() }.retain_weak();
                Weak::from_block(block)
            }
            None => Weak::null(),
        }
    }

    pub(super) fn into_block(mut self) -> Option<NonNull<RcBlock<T, C>>> {
        self.block.take()
    }
}

impl<T, C: RefCounter> Drop for Unique<T, C> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T, C: RefCounter> Default for Unique<T, C> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T, C: RefCounter> InitState for Unique<T, C> {
    const INIT: Self = Self::null();
}

impl<T, C: RefCounter> fmt::Debug for Unique<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unique")
            .field("ptr", &self.as_ptr())
            .field("weak", &self.weak_count())
            .finish()
    }
}
