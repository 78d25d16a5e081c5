//! Object lifetime protocol over raw slots.
//!
//! Every operation here works on memory the caller manages (a slot inside a
//! hook-allocated buffer, a control block, a stack local reached through a
//! raw pointer):
//!
//! | operation | effect |
//! |---|---|
//! | [`initialize`] | write `T::INIT`, no user code |
//! | [`construct`] | write a constructed value into uninitialized memory |
//! | [`destruct_with`] | run the per-type destroy (drop glue by default) |
//! | [`move_slot`] | bit-blit, post-move hook, reset source to `INIT` |
//! | [`copy_slot`] | clone into the destination, post-copy hook |
//!
//! A type customizes the protocol by implementing [`Lifecycle`]; the
//! resolved function table is a [`Descriptor`]. Types that need nothing
//! special use [`Descriptor::plain`], which is their ordinary `Drop`.
//! Field and base cleanup ordering is the language's drop order: a value's
//! own `Drop` runs first, then its fields, outermost to innermost.

#![allow(unsafe_code)]

mod heap;
mod init;

pub use heap::{
    delete_object, delete_object_with, dup_slice, free_buffer, new_object, resize_buffer,
    resize_buffer_with, try_new_object,
};
pub use init::InitState;

use std::mem::size_of;
use std::ptr;

use rcheap_membrane::hooks;

/// Per-type overrides of the lifetime protocol.
///
/// All items have defaults, so an empty `impl Lifecycle for T {}` is the
/// same as the plain descriptor.
pub trait Lifecycle: Sized {
    /// When the last strong reference of a managed smart pointer is dropped
    /// while an autorelease pool is active on that thread, destruction is
    /// deferred until the pool pops.
    const AUTORELEASE: bool = false;

    /// Tear down the value in `slot`. Replaces the drop glue.
    ///
    /// # Safety
    /// `slot` holds a live value that is destroyed exactly once.
    unsafe fn destroy(slot: *mut Self) {
        // SAFETY: forwarded caller contract.
        unsafe { ptr::drop_in_place(slot) }
    }

    /// Fix-up run on the destination after a bitwise move.
    fn post_move(&mut self) {}

    /// Fix-up run on the destination after a copy.
    fn post_copy(&mut self) {}
}

unsafe fn drop_glue<T>(slot: *mut T) {
    // SAFETY: forwarded caller contract.
    unsafe { ptr::drop_in_place(slot) }
}

/// Resolved lifetime hooks for `T`.
pub struct Descriptor<T> {
    pub destroy: unsafe fn(*mut T),
    pub post_move: Option<fn(&mut T)>,
    pub post_copy: Option<fn(&mut T)>,
    pub autorelease: bool,
}

impl<T> Clone for Descriptor<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Descriptor<T> {}

impl<T> std::fmt::Debug for Descriptor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Descriptor")
            .field("post_move", &self.post_move.is_some())
            .field("post_copy", &self.post_copy.is_some())
            .field("autorelease", &self.autorelease)
            .finish_non_exhaustive()
    }
}

impl<T> Descriptor<T> {
    /// Drop glue, no hooks.
    #[must_use]
    pub const fn plain() -> Self {
        Self {
            destroy: drop_glue::<T>,
            post_move: None,
            post_copy: None,
            autorelease: false,
        }
    }

    /// Replace the destroy callback.
    #[must_use]
    pub const fn with_destroy(mut self, destroy: unsafe fn(*mut T)) -> Self {
        self.destroy = destroy;
        self
    }

    /// Set the autorelease flag.
    #[must_use]
    pub const fn with_autorelease(mut self, autorelease: bool) -> Self {
        self.autorelease = autorelease;
        self
    }
}

impl<T: Lifecycle> Descriptor<T> {
    /// The table resolved from `T`'s [`Lifecycle`] impl.
    #[must_use]
    pub const fn of() -> Self {
        Self {
            destroy: <T as Lifecycle>::destroy,
            post_move: Some(<T as Lifecycle>::post_move),
            post_copy: Some(<T as Lifecycle>::post_copy),
            autorelease: T::AUTORELEASE,
        }
    }
}

impl<T> Default for Descriptor<T> {
    fn default() -> Self {
        Self::plain()
    }
}

/// Write `T::INIT` into `slot`.
///
/// # Safety
/// `slot` is valid for writes and aligned. Any previous value is overwritten
/// without being destroyed.
#[inline]
pub unsafe fn initialize<T: InitState>(slot: *mut T) {
    // SAFETY: forwarded caller contract.
    unsafe { slot.write(T::INIT) }
}

/// Fill `slot` with zero bytes through the fill hook.
///
/// # Safety
/// `slot` is valid for writes, and all-zero bytes are a valid `T` if the slot
/// will later be read as one.
#[inline]
pub unsafe fn zero_initialize<T>(slot: *mut T) {
    // SAFETY: forwarded caller contract.
    unsafe { hooks::fill(slot.cast(), 0, size_of::<T>()) };
}

/// Write `value` into uninitialized `slot`.
///
/// # Safety
/// `slot` is valid for writes and aligned; it must not hold a live value.
#[inline]
pub unsafe fn construct<T>(slot: *mut T, value: T) {
    // SAFETY: forwarded caller contract.
    unsafe { slot.write(value) }
}

/// Construct in place from a closure.
///
/// # Safety
/// Same as [`construct`]. If `make` panics the slot stays uninitialized.
#[inline]
pub unsafe fn construct_with<T>(slot: *mut T, make: impl FnOnce() -> T) {
    // SAFETY: forwarded caller contract.
    unsafe { slot.write(make()) }
}

/// Destroy the value in `slot` with its drop glue.
///
/// # Safety
/// `slot` holds a live value; afterwards it is uninitialized. Destroying a
/// slot twice is undefined behavior.
#[inline]
pub unsafe fn destruct<T>(slot: *mut T) {
    // SAFETY: forwarded caller contract.
    unsafe { destruct_with(slot, &Descriptor::plain()) }
}

/// Destroy the value in `slot` through `desc`.
///
/// # Safety
/// See [`destruct`].
#[inline]
pub unsafe fn destruct_with<T>(slot: *mut T, desc: &Descriptor<T>) {
    // SAFETY: forwarded caller contract.
    unsafe { (desc.destroy)(slot) }
}

/// Destroy, then leave the slot holding `T::INIT` so it may be reused or
/// destroyed again.
///
/// # Safety
/// See [`destruct`].
#[inline]
pub unsafe fn destruct_reinit<T: InitState>(slot: *mut T, desc: &Descriptor<T>) {
    // SAFETY: forwarded caller contract.
    unsafe {
        destruct_with(slot, desc);
        initialize(slot);
    }
}

/// Move the value in `src` into `dst`.
///
/// The bytes are copied, `post_move` runs on the destination, and `src` is
/// reset to `T::INIT` without its destructor ever running, so the moved
/// value is owned exactly once.
///
/// # Safety
/// `src` holds a live value; `dst` is valid, aligned, uninitialized and does
/// not overlap `src`.
#[inline]
pub unsafe fn move_slot<T: InitState>(src: *mut T, dst: *mut T, desc: &Descriptor<T>) {
    // SAFETY: forwarded caller contract.
    unsafe {
        ptr::copy_nonoverlapping(src, dst, 1);
        if let Some(post_move) = desc.post_move {
            post_move(&mut *dst);
        }
        src.write(T::INIT);
    }
}

/// Copy the value in `src` into `dst` via `Clone`, then run `post_copy`.
///
/// # Safety
/// `src` holds a live value; `dst` is valid, aligned and uninitialized.
#[inline]
pub unsafe fn copy_slot<T: Clone>(src: *const T, dst: *mut T, desc: &Descriptor<T>) {
    // SAFETY: forwarded caller contract.
    unsafe {
        dst.write((*src).clone());
        if let Some(post_copy) = desc.post_copy {
            post_copy(&mut *dst);
        }
    }
}

/// Bitwise copy for types without ownership.
///
/// # Safety
/// `src` is readable, `dst` writable; both aligned.
#[inline]
pub unsafe fn copy_bits<T: Copy>(src: *const T, dst: *mut T) {
    // SAFETY: forwarded caller contract.
    unsafe { ptr::copy(src, dst, 1) }
}

/// Write `T::INIT` into `len` consecutive slots.
///
/// # Safety
/// `first` is valid for `len` writes.
pub unsafe fn initialize_slice<T: InitState>(first: *mut T, len: usize) {
    for i in 0..len {
        // SAFETY: `i < len`.
        unsafe { first.add(i).write(T::INIT) };
    }
}

/// Destroy `len` consecutive live values, first to last.
///
/// # Safety
/// `first` points at `len` live values, each destroyed exactly once.
pub unsafe fn destruct_slice<T>(first: *mut T, len: usize, desc: &Descriptor<T>) {
    for i in 0..len {
        // SAFETY: `i < len`.
        unsafe { (desc.destroy)(first.add(i)) };
    }
}

/// Clone every element of `src` into consecutive slots at `dst`.
///
/// # Safety
/// `dst` is valid for `src.len()` writes and does not overlap `src`. If a
/// `clone` panics, the already-written prefix is leaked.
pub unsafe fn copy_slice<T: Clone>(src: &[T], dst: *mut T, desc: &Descriptor<T>) {
    for (i, item) in src.iter().enumerate() {
        // SAFETY: `i < src.len()`.
        unsafe { copy_slot(item, dst.add(i), desc) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::mem::MaybeUninit;

    thread_local! {
        static EVENTS: RefCell<Vec<&'static str>> = const { RefCell::new(Vec::new()) };
    }

    fn note(event: &'static str) {
        EVENTS.with(|e| e.borrow_mut().push(event));
    }

    fn take_events() -> Vec<&'static str> {
        EVENTS.with(|e| std::mem::take(&mut *e.borrow_mut()))
    }

    struct Base;
    impl Drop for Base {
        fn drop(&mut self) {
            note("base");
        }
    }

    struct Derived {
        _base: Base,
    }
    impl Drop for Derived {
        fn drop(&mut self) {
            note("derived");
        }
    }

    #[derive(Clone)]
    struct Tracked {
        moved: u32,
        copied: u32,
    }

    impl Lifecycle for Tracked {
        unsafe fn destroy(_slot: *mut Self) {
            note("custom_destroy");
        }
        fn post_move(&mut self) {
            self.moved += 1;
        }
        fn post_copy(&mut self) {
            self.copied += 1;
        }
    }

    #[test]
    fn destruct_runs_outer_cleanup_before_embedded_base() {
        take_events();
        let mut slot = MaybeUninit::<Derived>::uninit();
        unsafe {
            construct(slot.as_mut_ptr(), Derived { _base: Base });
            destruct(slot.as_mut_ptr());
        }
        assert_eq!(take_events(), ["derived", "base"]);
    }

    #[test]
    fn custom_destroy_replaces_drop_glue() {
        take_events();
        let mut slot = MaybeUninit::<Tracked>::uninit();
        let desc = Descriptor::<Tracked>::of();
        unsafe {
            construct(slot.as_mut_ptr(), Tracked { moved: 0, copied: 0 });
            destruct_with(slot.as_mut_ptr(), &desc);
        }
        assert_eq!(take_events(), ["custom_destroy"]);
    }

    #[test]
    fn plain_destroy_of_trivial_type_is_a_noop() {
        let mut x = 42u64;
        unsafe { destruct(&raw mut x) };
        assert_eq!(x, 42);
    }

    #[test]
    fn destruct_reinit_leaves_reusable_slot() {
        let mut slot: Option<String> = Some("payload".to_owned());
        unsafe { destruct_reinit(&raw mut slot, &Descriptor::plain()) };
        assert!(slot.is_none());
    }

    #[test]
    fn move_resets_source_and_owns_once() {
        let mut src: Option<Box<u32>> = Some(Box::new(9));
        let mut dst = MaybeUninit::<Option<Box<u32>>>::uninit();
        unsafe { move_slot(&raw mut src, dst.as_mut_ptr(), &Descriptor::plain()) };
        assert!(src.is_none());
        let dst = unsafe { dst.assume_init() };
        assert_eq!(dst.as_deref(), Some(&9));
    }

    #[test]
    fn move_and_copy_run_hooks_on_destination() {
        #[derive(Clone)]
        struct Hooked(u32);
        impl InitState for Hooked {
            const INIT: Self = Hooked(0);
        }
        impl Lifecycle for Hooked {
            fn post_move(&mut self) {
                self.0 += 100;
            }
            fn post_copy(&mut self) {
                self.0 += 1;
            }
        }

        let desc = Descriptor::<Hooked>::of();
        let mut a = Hooked(5);
        let mut b = MaybeUninit::<Hooked>::uninit();
        unsafe { move_slot(&raw mut a, b.as_mut_ptr(), &desc) };
        let b = unsafe { b.assume_init() };
        assert_eq!(a.0, 0);
        assert_eq!(b.0, 105);

        let mut c = MaybeUninit::<Hooked>::uninit();
        unsafe { copy_slot(&b, c.as_mut_ptr(), &desc) };
        assert_eq!(unsafe { c.assume_init() }.0, 106);
        assert_eq!(b.0, 105);
    }

    #[test]
    fn tracked_type_counts_through_descriptor() {
        let desc = Descriptor::<Tracked>::of();
        let src = Tracked { moved: 0, copied: 0 };
        let mut dst = MaybeUninit::<Tracked>::uninit();
        unsafe { copy_slot(&src, dst.as_mut_ptr(), &desc) };
        let dst = unsafe { dst.assume_init() };
        assert_eq!((dst.moved, dst.copied), (0, 1));
        assert!(!desc.autorelease);
    }

    #[test]
    fn zero_initialize_and_bit_copy() {
        let mut words = [0xFFFF_FFFFu32; 2];
        unsafe { zero_initialize(&raw mut words) };
        assert_eq!(words, [0, 0]);
        let src = 0xABCDu32;
        let mut dst = 0u32;
        unsafe { copy_bits(&src, &raw mut dst) };
        assert_eq!(dst, 0xABCD);
    }

    #[test]
    fn slice_helpers() {
        let src = vec!["a".to_owned(), "b".to_owned(), "c".to_owned()];
        let mut dst: [MaybeUninit<String>; 3] = [const { MaybeUninit::uninit() }; 3];
        let first = dst.as_mut_ptr().cast::<String>();
        unsafe {
            copy_slice(&src, first, &Descriptor::plain());
            assert_eq!(&*first.add(2), "c");
            destruct_slice(first, 3, &Descriptor::plain());
        }

        let mut counts: [MaybeUninit<u32>; 4] = [MaybeUninit::uninit(); 4];
        unsafe {
            initialize_slice(counts.as_mut_ptr().cast::<u32>(), 4);
            assert!(counts.iter().all(|c| c.assume_init() == 0));
        }
    }

    #[test]
    fn construct_with_closure() {
        let mut slot = MaybeUninit::<Vec<u8>>::uninit();
        unsafe {
            construct_with(slot.as_mut_ptr(), || vec![1, 2, 3]);
            assert_eq!(slot.assume_init_ref().len(), 3);
            destruct(slot.as_mut_ptr());
        }
    }
}
