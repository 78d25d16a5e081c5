//! Atomic primitives over 32-bit words and pointers.
//!
//! The free functions take a [`MemoryOrder`] and map it onto the strongest
//! ordering each operation accepts, so callers never hit the
//! "release load" / "acquire store" panics of `core::sync::atomic`.
//!
//! [`RefCounter`] abstracts the reference counts of a control block. The
//! default is [`AtomicCount`]; [`LocalCount`] is the non-atomic fallback for
//! single-threaded hosts and targets without atomics.

use core::cell::Cell;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering, fence};

use crate::hooks;

/// Requested memory ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryOrder {
    Relaxed,
    Acquire,
    Release,
    AcqRel,
    #[default]
    SeqCst,
}

impl MemoryOrder {
    /// Ordering for a plain load.
    #[must_use]
    pub const fn for_load(self) -> Ordering {
        match self {
            Self::Relaxed | Self::Release => Ordering::Relaxed,
            Self::Acquire | Self::AcqRel => Ordering::Acquire,
            Self::SeqCst => Ordering::SeqCst,
        }
    }

    /// Ordering for a plain store.
    #[must_use]
    pub const fn for_store(self) -> Ordering {
        match self {
            Self::Relaxed | Self::Acquire => Ordering::Relaxed,
            Self::Release | Self::AcqRel => Ordering::Release,
            Self::SeqCst => Ordering::SeqCst,
        }
    }

    /// Ordering for a read-modify-write (and a successful CAS).
    #[must_use]
    pub const fn for_rmw(self) -> Ordering {
        match self {
            Self::Relaxed => Ordering::Relaxed,
            Self::Acquire => Ordering::Acquire,
            Self::Release => Ordering::Release,
            Self::AcqRel => Ordering::AcqRel,
            Self::SeqCst => Ordering::SeqCst,
        }
    }

    /// Ordering for the failure side of a CAS.
    #[must_use]
    pub const fn for_failure(self) -> Ordering {
        self.for_load()
    }
}

#[inline]
pub fn load_u32(word: &AtomicU32, order: MemoryOrder) -> u32 {
    word.load(order.for_load())
}

#[inline]
pub fn store_u32(word: &AtomicU32, value: u32, order: MemoryOrder) {
    word.store(value, order.for_store());
}

/// Adds `value`, returning the previous contents (wrapping).
#[inline]
pub fn fetch_add_u32(word: &AtomicU32, value: u32, order: MemoryOrder) -> u32 {
    word.fetch_add(value, order.for_rmw())
}

/// Subtracts `value`, returning the previous contents (wrapping).
#[inline]
pub fn fetch_sub_u32(word: &AtomicU32, value: u32, order: MemoryOrder) -> u32 {
    word.fetch_sub(value, order.for_rmw())
}

/// Replaces `expected` with `desired`. Returns whether the swap happened.
#[inline]
pub fn compare_swap_u32(word: &AtomicU32, expected: u32, desired: u32, order: MemoryOrder) -> bool {
    word.compare_exchange(expected, desired, order.for_rmw(), order.for_failure())
        .is_ok()
}

#[inline]
pub fn load_ptr<T>(slot: &AtomicPtr<T>, order: MemoryOrder) -> *mut T {
    slot.load(order.for_load())
}

#[inline]
pub fn store_ptr<T>(slot: &AtomicPtr<T>, value: *mut T, order: MemoryOrder) {
    slot.store(value, order.for_store());
}

/// Stores `value`, returning the previous pointer.
#[inline]
pub fn swap_ptr<T>(slot: &AtomicPtr<T>, value: *mut T, order: MemoryOrder) -> *mut T {
    slot.swap(value, order.for_rmw())
}

#[inline]
pub fn compare_swap_ptr<T>(
    slot: &AtomicPtr<T>,
    expected: *mut T,
    desired: *mut T,
    order: MemoryOrder,
) -> bool {
    slot.compare_exchange(expected, desired, order.for_rmw(), order.for_failure())
        .is_ok()
}

/// Counts above this are treated as a leak of handles and abort.
pub const MAX_REFCOUNT: u32 = u32::MAX / 2;

/// A reference count stored in a control block.
///
/// Increments are relaxed, decrements release; a caller that observes the
/// 1 -> 0 transition must call [`RefCounter::acquire_fence`] before tearing
/// down what the count protected.
pub trait RefCounter {
    fn new(value: u32) -> Self;

    /// Current value (acquire).
    fn get(&self) -> u32;

    /// Adds one, returning the previous value.
    fn increment(&self) -> u32;

    /// Adds one unless the count is zero. Returns whether it was added.
    fn increment_if_nonzero(&self) -> bool;

    /// Subtracts one, returning the previous value, or `None` (and leaves
    /// the count at zero) when it already was zero.
    fn decrement(&self) -> Option<u32>;

    /// Synchronizes with every prior release decrement.
    fn acquire_fence(&self);
}

#[cold]
fn refcount_overflow() -> ! {
    hooks::fatal("reference count overflow")
}

/// Thread-safe count.
#[derive(Debug)]
pub struct AtomicCount(AtomicU32);

impl RefCounter for AtomicCount {
    #[inline]
    fn new(value: u32) -> Self {
        Self(AtomicU32::new(value))
    }

    #[inline]
    fn get(&self) -> u32 {
        load_u32(&self.0, MemoryOrder::Acquire)
    }

    #[inline]
    fn increment(&self) -> u32 {
        let prev = fetch_add_u32(&self.0, 1, MemoryOrder::Relaxed);
        if prev > MAX_REFCOUNT {
            refcount_overflow();
        }
        prev
    }

    #[inline]
    fn increment_if_nonzero(&self) -> bool {
        let mut current = load_u32(&self.0, MemoryOrder::Relaxed);
        loop {
            if current == 0 {
                return false;
            }
            if current > MAX_REFCOUNT {
                refcount_overflow();
            }
            if compare_swap_u32(&self.0, current, current + 1, MemoryOrder::Acquire) {
                return true;
            }
            current = load_u32(&self.0, MemoryOrder::Relaxed);
        }
    }

    #[inline]
    fn decrement(&self) -> Option<u32> {
        let mut current = load_u32(&self.0, MemoryOrder::Relaxed);
        loop {
            let next = current.checked_sub(1)?;
            if compare_swap_u32(&self.0, current, next, MemoryOrder::Release) {
                return Some(current);
            }
            current = load_u32(&self.0, MemoryOrder::Relaxed);
        }
    }

    #[inline]
    fn acquire_fence(&self) {
        fence(Ordering::Acquire);
    }
}

/// Non-atomic fallback count. Not `Sync`, so handles using it stay on one
/// thread.
#[derive(Debug)]
pub struct LocalCount(Cell<u32>);

impl RefCounter for LocalCount {
    #[inline]
    fn new(value: u32) -> Self {
        Self(Cell::new(value))
    }

    #[inline]
    fn get(&self) -> u32 {
        self.0.get()
    }

    #[inline]
    fn increment(&self) -> u32 {
        let prev = self.0.get();
        if prev > MAX_REFCOUNT {
            refcount_overflow();
        }
        self.0.set(prev + 1);
        prev
    }

    #[inline]
    fn increment_if_nonzero(&self) -> bool {
        match self.0.get() {
            0 => false,
            _ => {
                self.increment();
                true
            }
        }
    }

    #[inline]
    fn decrement(&self) -> Option<u32> {
        let prev = self.0.get();
        let next = prev.checked_sub(1)?;
        self.0.set(next);
        Some(prev)
    }

    #[inline]
    fn acquire_fence(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;
    use std::sync::Arc;

    #[test]
    fn order_mapping_never_yields_invalid_combinations() {
        assert_eq!(MemoryOrder::Release.for_load(), Ordering::Relaxed);
        assert_eq!(MemoryOrder::AcqRel.for_load(), Ordering::Acquire);
        assert_eq!(MemoryOrder::Acquire.for_store(), Ordering::Relaxed);
        assert_eq!(MemoryOrder::AcqRel.for_store(), Ordering::Release);
        assert_eq!(MemoryOrder::AcqRel.for_failure(), Ordering::Acquire);
        assert_eq!(MemoryOrder::default(), MemoryOrder::SeqCst);
    }

    #[test]
    fn word_operations() {
        let word = AtomicU32::new(5);
        assert_eq!(fetch_add_u32(&word, 3, MemoryOrder::AcqRel), 5);
        assert_eq!(fetch_sub_u32(&word, 1, MemoryOrder::Release), 8);
        assert_eq!(load_u32(&word, MemoryOrder::Acquire), 7);
        assert!(compare_swap_u32(&word, 7, 11, MemoryOrder::SeqCst));
        assert!(!compare_swap_u32(&word, 7, 13, MemoryOrder::SeqCst));
        store_u32(&word, 0, MemoryOrder::Release);
        assert_eq!(load_u32(&word, MemoryOrder::Relaxed), 0);
    }

    #[test]
    fn pointer_operations() {
        let mut a = 1u64;
        let mut b = 2u64;
        let slot = AtomicPtr::new(ptr::null_mut::<u64>());
        assert!(load_ptr(&slot, MemoryOrder::Acquire).is_null());
        store_ptr(&slot, &raw mut a, MemoryOrder::Release);
        assert!(compare_swap_ptr(&slot, &raw mut a, &raw mut b, MemoryOrder::AcqRel));
        assert!(!compare_swap_ptr(&slot, &raw mut a, ptr::null_mut(), MemoryOrder::AcqRel));
        assert_eq!(swap_ptr(&slot, ptr::null_mut(), MemoryOrder::AcqRel), &raw mut b);
        assert!(load_ptr(&slot, MemoryOrder::Relaxed).is_null());
    }

    fn exercise_counter<C: RefCounter>() {
        let c = C::new(1);
        assert_eq!(c.increment(), 1);
        assert_eq!(c.get(), 2);
        assert_eq!(c.decrement(), Some(2));
        assert_eq!(c.decrement(), Some(1));
        assert_eq!(c.get(), 0);
        assert_eq!(c.decrement(), None);
        assert_eq!(c.get(), 0);
        assert!(!c.increment_if_nonzero());
        let c = C::new(3);
        assert!(c.increment_if_nonzero());
        assert_eq!(c.get(), 4);
    }

    #[test]
    fn atomic_count_semantics() {
        exercise_counter::<AtomicCount>();
    }

    #[test]
    fn local_count_semantics() {
        exercise_counter::<LocalCount>();
    }

    #[test]
    fn concurrent_decrements_observe_one_zero_transition() {
        const THREADS: u32 = 8;
        const PER_THREAD: u32 = 1_000;
        let count = Arc::new(AtomicCount::new(THREADS * PER_THREAD));
        let zeros = Arc::new(AtomicU32::new(0));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let count = Arc::clone(&count);
                let zeros = Arc::clone(&zeros);
                std::thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        if count.decrement() == Some(1) {
                            zeros.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("thread");
        }
        assert_eq!(zeros.load(Ordering::Relaxed), 1);
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn upgrades_racing_releases_keep_the_count_balanced() {
        const THREADS: u32 = 4;
        const ROUNDS: u32 = 2_000;
        let count = Arc::new(AtomicCount::new(1));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let count = Arc::clone(&count);
                std::thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        assert!(count.increment_if_nonzero());
                        assert!(count.decrement().is_some_and(|prev| prev > 1));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("thread");
        }
        assert_eq!(count.get(), 1);
        assert_eq!(count.decrement(), Some(1));
        assert!(!count.increment_if_nonzero());
    }
}
