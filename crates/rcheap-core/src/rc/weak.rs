use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

use rcheap_membrane::atomic::{AtomicCount, MemoryOrder, RefCounter};

use super::Shared;
use super::block::RcBlock;
use crate::lifetime::InitState;

/// Non-owning observer of a [`Shared`] or [`Unique`](super::Unique) object.
///
/// A weak handle keeps the control block, never the object. Reads return a
/// raw pointer that is null once the last strong handle is gone.
pub struct Weak<T, C: RefCounter = AtomicCount> {
    block: Option<NonNull<RcBlock<T, C>>>,
    _marker: PhantomData<RcBlock<T, C>>,
}

// SAFETY: upgrading yields a `Shared`, which has the same bounds.
unsafe impl<T: Send + Sync, C: RefCounter + Send + Sync> Send for Weak<T, C> {}
// SAFETY: as above.
unsafe impl<T: Send + Sync, C: RefCounter + Send + Sync> Sync for Weak<T, C> {}

impl<T, C: RefCounter> Weak<T, C> {
    #[must_use]
    pub const fn null() -> Self {
        Self {
            block: None,
            _marker: PhantomData,
        }
    }

    /// Adopts one weak reference already counted in `block`.
    pub(super) fn from_block(block: NonNull<RcBlock<T, C>>) -> Self {
        Self {
            block: Some(block),
            _marker: PhantomData,
        }
    }

    #[inline]
    fn inner(&self) -> Option<&RcBlock<T, C>> {
        // SAFETY: a non-null weak handle keeps its block alive.
        self.block.map(|b| unsafe { &*b.as_ptr() })
    }

    /// Whether this handle observes no block at all.
    #[inline]
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.block.is_none()
    }

    /// The object, or null once it has been destroyed (relaxed load).
    ///
    /// The pointer is only safe to dereference while some strong handle is
    /// known to be alive.
    #[inline]
    #[must_use]
    pub fn get(&self) -> *const T {
        self.inner()
            .map_or(ptr::null(), |b| b.payload(MemoryOrder::Relaxed).cast_const())
    }

    /// [`get`](Self::get) with an acquire load.
    #[inline]
    #[must_use]
    pub fn get_atomic(&self) -> *const T {
        self.inner()
            .map_or(ptr::null(), |b| b.payload(MemoryOrder::Acquire).cast_const())
    }

    /// Whether the object is gone (or was never there).
    #[inline]
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.get_atomic().is_null()
    }

    /// A strong handle, or null when the object is destroyed or still held
    /// by a `Unique`.
    #[must_use]
    pub fn upgrade(&self) -> Shared<T, C> {
        match self.block {
            Some(block) if self.inner().is_some_and(RcBlock::try_upgrade) => {
                Shared::from_block(Some(block))
            }
            _ => Shared::null(),
        }
    }

    pub fn reset(&mut self) {
        if let Some(block) = self.block.take() {
            // SAFETY: this handle owned one weak reference.
            unsafe { RcBlock::release_weak(block) };
        }
    }

    #[must_use]
    pub fn take(&mut self) -> Self {
        Self {
            block: self.block.take(),
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn strong_count(&self) -> u32 {
        self.inner().map_or(0, RcBlock::strong_count)
    }

    #[must_use]
    pub fn weak_count(&self) -> u32 {
        self.inner().map_or(0, RcBlock::weak_count)
    }

    #[inline]
    #[must_use]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.block == other.block
    }
}

impl<T, C: RefCounter> Clone for Weak<T, C> {
    fn clone(&self) -> Self {
        match self.block {
            Some(block) => {
                // SAFETY: a non-null weak handle keeps its block alive.
                unsafe { block.as_ref() }.retain_weak();
                Self::from_block(block)
            }
            None => Self::null(),
        }
    }
}

impl<T, C: RefCounter> Drop for Weak<T, C> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T, C: RefCounter> Default for Weak<T, C> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T, C: RefCounter> InitState for Weak<T, C> {
    const INIT: Self = Self::null();
}

impl<T, C: RefCounter> fmt::Debug for Weak<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Weak")
            .field("ptr", &self.get())
            .field("strong", &self.strong_count())
            .finish()
    }
}
