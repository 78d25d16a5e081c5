//! Autorelease pools: LIFO frames of deferred releases.
//!
//! A [`PoolStack`] is an explicit, single-threaded context object. Each
//! thread also has a default stack behind the free functions ([`push`],
//! [`pop`], [`register_for_release`], [`autoreleasepool`], ...), which is
//! the one managed smart pointers defer into.
//!
//! Popping a frame runs its callbacks newest first, then removes the frame,
//! then notifies the foreign runtime bridge that observed its push, if any.
//! A pop whose handle does not name the topmost frame is an error
//! (`try_pop`) or fatal (`pop`); pools must nest strictly.

#![allow(unsafe_code)]

use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::mem::align_of;

use parking_lot::RwLock;
use rcheap_membrane::hooks;
use rcheap_membrane::log::{self, LogLevel, LogRecord};

use crate::aligned::aligned_free;
use crate::error::PoolError;
use crate::lifetime::{delete_object, new_object};

/// Deferred release callback, invoked with the registered item.
pub type ReleaseFn = unsafe fn(item: *mut c_void);

/// Observer of pool transitions in a foreign reference-counting runtime.
///
/// `on_push` returns an opaque context that is handed back to `on_pop`
/// when the same frame is popped.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PoolBridge {
    pub on_push: unsafe extern "C" fn() -> *mut c_void,
    pub on_pop: unsafe extern "C" fn(ctx: *mut c_void),
}

static BRIDGE: RwLock<Option<PoolBridge>> = parking_lot::const_rwlock(None);

/// Install (or with `None`, remove) the process-wide bridge.
pub fn set_pool_bridge(bridge: Option<PoolBridge>) {
    *BRIDGE.write() = bridge;
    log::emit(
        LogRecord::new(LogLevel::Info, "pool", "bridge_set")
            .with_outcome(if bridge.is_some() { "installed" } else { "cleared" }),
    );
}

#[must_use]
pub fn pool_bridge() -> Option<PoolBridge> {
    *BRIDGE.read()
}

/// Names one pushed frame; only used to check pairing on pop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolHandle {
    id: u64,
}

impl PoolHandle {
    #[must_use]
    pub const fn id(self) -> u64 {
        self.id
    }

    /// Rebuild a handle from an id that crossed a foreign boundary.
    #[must_use]
    pub const fn from_id(id: u64) -> Self {
        Self { id }
    }
}

struct Entry {
    item: *mut c_void,
    release: ReleaseFn,
}

struct Frame {
    id: u64,
    entries: Vec<Entry>,
    /// Bridge that saw this frame's push, with the context it returned.
    bridge: Option<(PoolBridge, *mut c_void)>,
}

/// A stack of autorelease frames.
pub struct PoolStack {
    frames: RefCell<Vec<Frame>>,
    next_id: Cell<u64>,
}

impl PoolStack {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            frames: RefCell::new(Vec::new()),
            next_id: Cell::new(1),
        }
    }

    /// Open a new, empty frame on top of the stack.
    pub fn push(&self) -> PoolHandle {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        // SAFETY: the bridge contract is the installer's.
        let bridge = pool_bridge().map(|b| (b, unsafe { (b.on_push)() }));
        self.frames.borrow_mut().push(Frame {
            id,
            entries: Vec::new(),
            bridge,
        });
        if log::enabled(LogLevel::Trace) {
            log::emit(
                LogRecord::new(LogLevel::Trace, "pool", "push")
                    .with_details(format!("id={id} depth={}", self.depth())),
            );
        }
        PoolHandle { id }
    }

    fn check_top(&self, handle: PoolHandle) -> Result<usize, PoolError> {
        let frames = self.frames.borrow();
        match frames.last() {
            None => Err(PoolError::Empty),
            Some(top) if top.id != handle.id => Err(PoolError::Mismatch {
                expected: handle.id,
                top: top.id,
            }),
            Some(_) => Ok(frames.len() - 1),
        }
    }

    /// Release everything registered in `handle`'s frame, newest first, and
    /// remove it.
    ///
    /// Callbacks may register further items; those land in the frame being
    /// drained and are released in the same pop.
    pub fn try_pop(&self, handle: PoolHandle) -> Result<(), PoolError> {
        let index = self.check_top(handle).inspect_err(|err| {
            log::emit(
                LogRecord::new(LogLevel::Error, "pool", "pop_rejected")
                    .with_outcome("mismatch")
                    .with_details(err.to_string()),
            );
        })?;

        let mut released = 0usize;
        loop {
            let next = self
                .frames
                .borrow_mut()
                .get_mut(index)
                .and_then(|frame| frame.entries.pop());
            let Some(entry) = next else { break };
            // SAFETY: the registrant vouched for `(item, release)`.
            unsafe { (entry.release)(entry.item) };
            released += 1;
        }

        let frame = {
            let mut frames = self.frames.borrow_mut();
            if frames.len() != index + 1 {
                drop(frames);
                hooks::fatal("autorelease pool popped with nested pools still open");
            }
            frames.pop()
        };
        if let Some(frame) = frame {
            // The bridge that saw the push sees the pop, even if the global
            // bridge changed in between.
            if let Some((bridge, ctx)) = frame.bridge {
                // SAFETY: hands back the context `on_push` produced.
                unsafe { (bridge.on_pop)(ctx) };
            }
            if log::enabled(LogLevel::Trace) {
                log::emit(
                    LogRecord::new(LogLevel::Trace, "pool", "pop")
                        .with_details(format!("id={} released={released}", frame.id)),
                );
            }
        }
        Ok(())
    }

    /// [`try_pop`](Self::try_pop), terminating on a pairing error.
    pub fn pop(&self, handle: PoolHandle) {
        if let Err(err) = self.try_pop(handle) {
            hooks::fatal(&err.to_string());
        }
    }

    /// Append `(item, release)` to the topmost frame.
    ///
    /// # Errors
    /// [`PoolError::Empty`] when no frame is open; nothing is registered.
    pub fn register_for_release(
        &self,
        item: *mut c_void,
        release: ReleaseFn,
    ) -> Result<(), PoolError> {
        let mut frames = self.frames.borrow_mut();
        let top = frames.last_mut().ok_or(PoolError::Empty)?;
        top.entries.push(Entry { item, release });
        Ok(())
    }

    /// Move `value` to the heap and drop it when the topmost frame pops.
    /// Without an open frame the value is handed back.
    pub fn autorelease<T>(&self, value: T) -> Result<(), T> {
        if self.depth() == 0 {
            return Err(value);
        }
        let obj = new_object(value);
        match self.register_for_release(obj.as_ptr().cast(), release_object::<T>) {
            Ok(()) => Ok(()),
            // SAFETY: `obj` was never registered; move the value out and free
            // only the block.
            Err(_) => unsafe {
                let value = obj.as_ptr().read();
                aligned_free(obj.as_ptr().cast(), align_of::<T>());
                Err(value)
            },
        }
    }

    /// Open frames.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.borrow().len()
    }

    /// Items registered in the topmost frame.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.frames.borrow().last().map_or(0, |f| f.entries.len())
    }

    /// Push a frame that pops when the guard drops.
    pub fn scope(&self) -> PoolGuard<'_> {
        PoolGuard {
            stack: self,
            handle: self.push(),
        }
    }
}

impl Default for PoolStack {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PoolStack {
    fn drop(&mut self) {
        loop {
            let top = self.frames.get_mut().last().map(|f| f.id);
            let Some(id) = top else { break };
            log::emit(
                LogRecord::new(LogLevel::Warn, "pool", "unpopped_frame")
                    .with_outcome("drained")
                    .with_details(format!("id={id}")),
            );
            self.pop(PoolHandle { id });
        }
    }
}

impl std::fmt::Debug for PoolStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolStack")
            .field("depth", &self.depth())
            .field("pending", &self.pending())
            .finish()
    }
}

unsafe fn release_object<T>(item: *mut c_void) {
    // SAFETY: registered by `autorelease` for an object from `new_object`.
    unsafe { delete_object(item.cast::<T>()) }
}

/// Scoped frame; pops (and releases) on drop.
#[must_use = "the frame pops as soon as the guard is dropped"]
pub struct PoolGuard<'a> {
    stack: &'a PoolStack,
    handle: PoolHandle,
}

impl PoolGuard<'_> {
    #[must_use]
    pub fn handle(&self) -> PoolHandle {
        self.handle
    }
}

impl Drop for PoolGuard<'_> {
    fn drop(&mut self) {
        self.stack.pop(self.handle);
    }
}

thread_local! {
    static CURRENT: PoolStack = const { PoolStack::new() };
}

/// Run `f` against this thread's default stack. `None` during thread
/// teardown.
pub fn with_current<R>(f: impl FnOnce(&PoolStack) -> R) -> Option<R> {
    CURRENT.try_with(f).ok()
}

fn current_or_fatal<R>(f: impl FnOnce(&PoolStack) -> R) -> R {
    match with_current(f) {
        Some(r) => r,
        None => hooks::fatal("autorelease pool used during thread teardown"),
    }
}

pub fn push() -> PoolHandle {
    current_or_fatal(PoolStack::push)
}

pub fn pop(handle: PoolHandle) {
    current_or_fatal(|s| s.pop(handle));
}

pub fn try_pop(handle: PoolHandle) -> Result<(), PoolError> {
    with_current(|s| s.try_pop(handle)).unwrap_or(Err(PoolError::Empty))
}

/// Register on this thread's topmost frame.
pub fn register_for_release(item: *mut c_void, release: ReleaseFn) -> Result<(), PoolError> {
    with_current(|s| s.register_for_release(item, release)).unwrap_or(Err(PoolError::Empty))
}

pub fn autorelease<T>(value: T) -> Result<(), T> {
    let mut slot = Some(value);
    let registered = with_current(|s| match slot.take() {
        Some(v) => s.autorelease(v),
        None => Ok(()),
    });
    match registered {
        Some(result) => result,
        None => slot.map_or(Ok(()), Err),
    }
}

/// Run `f` inside a fresh frame on this thread's stack.
pub fn autoreleasepool<R>(f: impl FnOnce() -> R) -> R {
    current_or_fatal(|s| {
        let _frame = s.scope();
        f()
    })
}

#[must_use]
pub fn has_active_pool() -> bool {
    depth() > 0
}

#[must_use]
pub fn depth() -> usize {
    with_current(PoolStack::depth).unwrap_or(0)
}

#[must_use]
pub fn pending() -> usize {
    with_current(PoolStack::pending).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;
    use std::rc::Rc;

    thread_local! {
        static ORDER: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
    }

    unsafe fn record(item: *mut c_void) {
        ORDER.with(|o| o.borrow_mut().push(item as usize));
    }

    fn take_order() -> Vec<usize> {
        ORDER.with(|o| std::mem::take(&mut *o.borrow_mut()))
    }

    #[test]
    fn releases_run_newest_first() {
        take_order();
        let stack = PoolStack::new();
        let handle = stack.push();
        for item in [1usize, 2, 3] {
            stack.register_for_release(item as *mut c_void, record).expect("frame");
        }
        assert_eq!(stack.pending(), 3);
        stack.pop(handle);
        assert_eq!(take_order(), [3, 2, 1]);
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn mismatched_pop_is_rejected_and_frame_survives() {
        let stack = PoolStack::new();
        let outer = stack.push();
        let inner = stack.push();
        assert_eq!(
            stack.try_pop(outer),
            Err(PoolError::Mismatch {
                expected: outer.id(),
                top: inner.id()
            })
        );
        assert_eq!(stack.depth(), 2);
        stack.pop(inner);
        stack.pop(outer);
        assert_eq!(stack.try_pop(outer), Err(PoolError::Empty));
    }

    #[test]
    fn register_without_frame_is_an_error() {
        let stack = PoolStack::new();
        assert_eq!(
            stack.register_for_release(ptr::null_mut(), record),
            Err(PoolError::Empty)
        );
        assert_eq!(stack.autorelease(String::from("back")), Err(String::from("back")));
    }

    #[test]
    fn nested_frames_release_independently() {
        take_order();
        let stack = PoolStack::new();
        let outer = stack.scope();
        stack.register_for_release(10usize as *mut c_void, record).expect("outer");
        {
            let _inner = stack.scope();
            stack.register_for_release(20usize as *mut c_void, record).expect("inner");
        }
        assert_eq!(take_order(), [20]);
        drop(outer);
        assert_eq!(take_order(), [10]);
    }

    #[test]
    fn autorelease_drops_value_on_pop() {
        let marker = Rc::new(());
        let stack = PoolStack::new();
        let handle = stack.push();
        stack.autorelease(Rc::clone(&marker)).expect("frame");
        assert_eq!(Rc::strong_count(&marker), 2);
        stack.pop(handle);
        assert_eq!(Rc::strong_count(&marker), 1);
    }

    #[test]
    fn release_callbacks_can_register_more() {
        thread_local! {
            static STACK: PoolStack = const { PoolStack::new() };
        }
        unsafe fn chain(_item: *mut c_void) {
            STACK.with(|s| s.register_for_release(99usize as *mut c_void, record).expect("frame"));
        }
        take_order();
        STACK.with(|s| {
            let handle = s.push();
            s.register_for_release(ptr::null_mut(), chain).expect("frame");
            s.pop(handle);
        });
        assert_eq!(take_order(), [99]);
    }

    #[test]
    fn dropping_the_stack_drains_open_frames() {
        let marker = Rc::new(());
        {
            let stack = PoolStack::new();
            let _ = stack.push();
            stack.autorelease(Rc::clone(&marker)).expect("frame");
        }
        assert_eq!(Rc::strong_count(&marker), 1);
    }

    #[test]
    fn thread_default_stack() {
        assert!(!has_active_pool());
        assert!(autorelease(5u32).is_err());
        let marker = Rc::new(());
        let out = autoreleasepool(|| {
            assert!(has_active_pool());
            autorelease(Rc::clone(&marker)).expect("frame");
            assert_eq!(pending(), 1);
            7
        });
        assert_eq!(out, 7);
        assert_eq!(Rc::strong_count(&marker), 1);
        assert_eq!(depth(), 0);
        assert_eq!(try_pop(PoolHandle { id: 1 }), Err(PoolError::Empty));
    }
}
