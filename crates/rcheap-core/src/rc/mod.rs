//! Unique, shared and weak handles over one control block per object.
//!
//! Control blocks come from the aligned allocator. Payloads are torn down
//! through their [`Descriptor`](crate::lifetime::Descriptor), which may defer
//! destruction into the current thread's autorelease pool.
//!
//! Handles are nullable. A null handle (from `null()`, `take()`, `reset()`,
//! or adopting a null object) reads as `None`/null and releasing it is a
//! no-op.

#![allow(unsafe_code)]

mod block;
mod shared;
mod unique;
mod weak;

pub use shared::Shared;
pub use unique::Unique;
pub use weak::Weak;

use rcheap_membrane::hooks;

use crate::error::AllocError;

#[cold]
fn oom(err: AllocError) -> ! {
    hooks::fatal(&format!("out of memory: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifetime::{Descriptor, Lifecycle, new_object};
    use crate::pool;
    use rcheap_membrane::atomic::LocalCount;
    use std::cell::Cell;
    use std::rc::Rc;

    struct DropCounter(Rc<Cell<u32>>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    fn counter() -> Rc<Cell<u32>> {
        Rc::new(Cell::new(0))
    }

    #[test]
    fn shared_clones_destroy_once() {
        let drops = counter();
        let first: Shared<_, LocalCount> = Shared::new(DropCounter(Rc::clone(&drops)));
        let copies: Vec<_> = (0..5).map(|_| first.clone()).collect();
        assert_eq!(first.strong_count(), 6);
        drop(copies);
        assert_eq!(drops.get(), 0);
        assert_eq!(first.strong_count(), 1);
        drop(first);
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn weak_sees_null_after_last_strong() {
        let drops = counter();
        let strong: Shared<_, LocalCount> = Shared::new(DropCounter(Rc::clone(&drops)));
        let weak = strong.downgrade();
        assert_eq!(weak.get(), strong.as_ptr());
        assert_eq!(strong.weak_count(), 1);
        let again = weak.upgrade();
        assert_eq!(strong.strong_count(), 2);
        drop(again);
        drop(strong);
        assert_eq!(drops.get(), 1);
        assert!(weak.get().is_null());
        assert!(weak.get_atomic().is_null());
        assert!(weak.is_expired());
        assert!(weak.upgrade().is_null());
        assert_eq!(weak.strong_count(), 0);
        assert_eq!(weak.weak_count(), 1);
    }

    #[test]
    fn unique_move_leaves_null_source() {
        let drops = counter();
        let mut a: Unique<_, LocalCount> = Unique::new(DropCounter(Rc::clone(&drops)));
        let before = a.as_ptr();
        let b = a.take();
        assert!(a.is_null());
        assert!(a.get().is_none());
        assert_eq!(b.as_ptr(), before);
        drop(a);
        assert_eq!(drops.get(), 0);
        drop(b);
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn unique_weak_cannot_upgrade_until_shared() {
        let mut unique: Unique<u32, LocalCount> = Unique::new(7);
        let weak = unique.downgrade();
        assert!(weak.upgrade().is_null());
        *unique.get_mut().expect("live") += 1;
        let shared = Shared::from_unique(unique);
        let upgraded = weak.upgrade();
        assert_eq!(upgraded.get(), Some(&8));
        assert!(Shared::ptr_eq(&shared, &upgraded));
    }

    #[test]
    fn unique_drop_destroys_even_with_weak_observers() {
        let drops = counter();
        let unique: Unique<_, LocalCount> = Unique::new(DropCounter(Rc::clone(&drops)));
        let weak = unique.downgrade();
        drop(unique);
        assert_eq!(drops.get(), 1);
        assert!(weak.get().is_null());
    }

    #[test]
    fn null_handles_are_inert() {
        let mut s: Shared<String> = Shared::null();
        let c = s.clone();
        assert!(c.is_null() && s.get().is_none() && s.get_atomic().is_none());
        assert_eq!(s.strong_count(), 0);
        s.reset();
        assert!(s.downgrade().upgrade().is_null());
        let adopted: Unique<String> = unsafe { Unique::from_object(std::ptr::null_mut()) };
        assert!(adopted.is_null());
    }

    #[test]
    fn adopts_heap_objects() {
        let drops = counter();
        let obj = new_object(DropCounter(Rc::clone(&drops)));
        let shared: Shared<_, LocalCount> = unsafe { Shared::from_object(obj.as_ptr()) };
        assert_eq!(shared.as_ptr(), obj.as_ptr().cast_const());
        drop(shared);
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn reset_releases_early() {
        let drops = counter();
        let mut a: Shared<_, LocalCount> = Shared::new(DropCounter(Rc::clone(&drops)));
        let b = a.clone();
        a.reset();
        assert!(a.is_null());
        assert_eq!(b.strong_count(), 1);
        drop(b);
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn custom_destroy_override_runs_instead_of_drop() {
        thread_local! {
            static DESTROYED: Cell<u32> = const { Cell::new(0) };
        }
        struct Handle(u32);
        impl Drop for Handle {
            fn drop(&mut self) {
                panic!("drop glue must not run");
            }
        }
        impl Lifecycle for Handle {
            unsafe fn destroy(slot: *mut Self) {
                let id = unsafe { (*slot).0 };
                DESTROYED.with(|d| d.set(d.get() + id));
            }
        }
        let s: Shared<Handle, LocalCount> = Shared::new_managed(Handle(5));
        drop(s);
        assert_eq!(DESTROYED.with(Cell::get), 5);
    }

    #[test]
    fn explicit_descriptor_destroy() {
        thread_local! {
            static SEEN: Cell<u32> = const { Cell::new(0) };
        }
        unsafe fn record(slot: *mut u32) {
            SEEN.with(|s| s.set(unsafe { *slot }));
        }
        let u: Unique<u32, LocalCount> =
            Unique::new_with(41, &Descriptor::plain().with_destroy(record));
        drop(u);
        assert_eq!(SEEN.with(Cell::get), 41);
    }

    struct Pooled(Rc<Cell<u32>>);

    impl Drop for Pooled {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    impl Lifecycle for Pooled {
        const AUTORELEASE: bool = true;
    }

    #[test]
    fn autorelease_types_defer_into_active_pool() {
        let drops = counter();
        let handle = pool::push();
        let strong: Shared<_, LocalCount> = Shared::new_managed(Pooled(Rc::clone(&drops)));
        let weak = strong.downgrade();
        drop(strong);
        assert!(weak.get().is_null());
        assert_eq!(drops.get(), 0);
        assert_eq!(pool::pending(), 1);
        pool::pop(handle);
        assert_eq!(drops.get(), 1);
        assert_eq!(weak.weak_count(), 1);
    }

    #[test]
    fn autorelease_without_pool_destroys_immediately() {
        let drops = counter();
        let strong: Shared<_, LocalCount> = Shared::new_managed(Pooled(Rc::clone(&drops)));
        drop(strong);
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn handles_are_init_state() {
        use crate::lifetime::InitState;
        let s = <Shared<u8> as InitState>::INIT;
        let w = <Weak<u8> as InitState>::INIT;
        assert!(s.is_null() && w.is_null());
    }

    #[test]
    fn atomic_handles_are_send_and_sync() {
        fn assert_send_sync<X: Send + Sync>() {}
        assert_send_sync::<Shared<String>>();
        assert_send_sync::<Unique<Vec<u8>>>();
        assert_send_sync::<Weak<u64>>();
    }
}
