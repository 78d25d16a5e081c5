use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

use rcheap_membrane::atomic::{AtomicCount, MemoryOrder, RefCounter};

use super::block::RcBlock;
use super::{Unique, Weak, oom};
use crate::error::AllocError;
use crate::lifetime::{Descriptor, InitState, Lifecycle};

/// Reference-counted strong handle.
///
/// Cloning increments the strong count; dropping decrements it, and the
/// drop that reaches zero destroys the object. With [`AtomicCount`] the
/// handles may be cloned and dropped from any number of threads and exactly
/// one of them performs the destruction.
pub struct Shared<T, C: RefCounter = AtomicCount> {
    block: Option<NonNull<RcBlock<T, C>>>,
    _marker: PhantomData<RcBlock<T, C>>,
}

// SAFETY: the object is shared between threads and may be destroyed on
// whichever thread drops last.
unsafe impl<T: Send + Sync, C: RefCounter + Send + Sync> Send for Shared<T, C> {}
// SAFETY: as above.
unsafe impl<T: Send + Sync, C: RefCounter + Send + Sync> Sync for Shared<T, C> {}

impl<T, C: RefCounter> Shared<T, C> {
    #[must_use]
    pub const fn null() -> Self {
        Self {
            block: None,
            _marker: PhantomData,
        }
    }

    pub fn new(value: T) -> Self {
        Self::try_new(value).unwrap_or_else(|err| oom(err))
    }

    pub fn try_new(value: T) -> Result<Self, AllocError> {
        Self::try_new_with(value, &Descriptor::plain())
    }

    pub fn new_with(value: T, desc: &Descriptor<T>) -> Self {
        Self::try_new_with(value, desc).unwrap_or_else(|err| oom(err))
    }

    pub fn try_new_with(value: T, desc: &Descriptor<T>) -> Result<Self, AllocError> {
        RcBlock::with_value(value, desc, false).map(|b| Self::from_block(Some(b)))
    }

    /// Box `value` using its [`Lifecycle`] overrides, including autorelease
    /// deferral of the final destruction.
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
        match unsafe { RcBlock::adopt(object, &Descriptor::plain(), false) } {
            Ok(block) => Self::from_block(Some(block)),
            Err(err) => oom(err),
        }
    }

    /// Convert a unique owner without reallocating; weak observers of it
    /// may upgrade from now on.
    #[must_use]
    pub fn from_unique(unique: Unique<T, C>) -> Self {
        let block = unique.into_block();
        if let Some(b) = block {
            // SAFETY: the strong reference moved into this handle.
            unsafe { b.as_ref() }.release_unique();
        }
        Self::from_block(block)
    }

    /// Adopts one strong reference already counted in `block`.
    pub(super) fn from_block(block: Option<NonNull<RcBlock<T, C>>>) -> Self {
        Self {
            block,
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

    #[inline]
    #[must_use]
    pub fn get(&self) -> Option<&T> {
        let p = self.inner()?.payload(MemoryOrder::Relaxed);
        // SAFETY: the payload lives while a strong handle does.
        unsafe { p.as_ref() }
    }

    /// Like [`get`](Self::get) but with an acquire load, for handles
    /// received from another thread.
    #[inline]
    #[must_use]
    pub fn get_atomic(&self) -> Option<&T> {
        let p = self.inner()?.payload(MemoryOrder::Acquire);
        // SAFETY: the payload lives while a strong handle does.
        unsafe { p.as_ref() }
    }

    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *const T {
        self.inner()
            .map_or(ptr::null(), |b| b.payload(MemoryOrder::Relaxed).cast_const())
    }

    /// Release this handle's strong reference now and become null.
    pub fn reset(&mut self) {
        if let Some(block) = self.block.take() {
            // SAFETY: this handle owned one strong reference.
            unsafe { RcBlock::release_strong(block) };
        }
    }

    #[must_use]
    pub fn take(&mut self) -> Self {
        Self::from_block(self.block.take())
    }

    #[must_use]
    pub fn strong_count(&self) -> u32 {
        self.inner().map_or(0, RcBlock::strong_count)
    }

    #[must_use]
    pub fn weak_count(&self) -> u32 {
        self.inner().map_or(0, RcBlock::weak_count)
    }

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

    /// Whether both handles share one control block. Two null handles are
    /// equal.
    #[inline]
    #[must_use]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.block == other.block
    }
}

impl<T, C: RefCounter> Clone for Shared<T, C> {
    fn clone(&self) -> Self {
        if let Some(b) = self.inner() {
            b.retain_strong();
        }
        Self::from_block(self.block)
    }
}

impl<T, C: RefCounter> Drop for Shared<T, C> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T, C: RefCounter> From<Unique<T, C>> for Shared<T, C> {
    fn from(unique: Unique<T, C>) -> Self {
        Self::from_unique(unique)
    }
}

impl<T, C: RefCounter> Default for Shared<T, C> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T, C: RefCounter> InitState for Shared<T, C> {
    const INIT: Self = Self::null();
}

impl<T, C: RefCounter> fmt::Debug for Shared<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("ptr", &self.as_ptr())
            .field("strong", &self.strong_count())
            .field("weak", &self.weak_count())
            .finish()
    }
}
