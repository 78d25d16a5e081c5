#![no_main]
use std::cell::RefCell;
use std::ffi::c_void;

use libfuzzer_sys::fuzz_target;
use rcheap_core::pool::{PoolHandle, PoolStack};

thread_local! {
    static RELEASED: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

unsafe fn record(item: *mut c_void) {
    RELEASED.with(|r| r.borrow_mut().push(item as usize));
}

fuzz_target!(|data: &[u8]| {
    // Model: a stack of frames, each a list of registered items. Pops must
    // release exactly the top frame's items in reverse.
    let stack = PoolStack::new();
    let mut model: Vec<(PoolHandle, Vec<usize>)> = Vec::new();
    let mut next_item = 1usize;

    for &byte in data {
        match byte % 4 {
            0 => model.push((stack.push(), Vec::new())),
            1 => {
                let registered = stack.register_for_release(next_item as *mut c_void, record);
                match model.last_mut() {
                    Some((_, items)) => {
                        assert!(registered.is_ok());
                        items.push(next_item);
                    }
                    None => assert!(registered.is_err()),
                }
                next_item += 1;
            }
            2 => {
                if let Some((handle, mut items)) = model.pop() {
                    RELEASED.with(|r| r.borrow_mut().clear());
                    stack.try_pop(handle).expect("top frame");
                    items.reverse();
                    RELEASED.with(|r| assert_eq!(*r.borrow(), items));
                }
            }
            _ => {
                // Popping a non-top frame must be rejected without side effects.
                if model.len() >= 2 {
                    let (handle, _) = model[0];
                    assert!(stack.try_pop(handle).is_err());
                    assert_eq!(stack.depth(), model.len());
                }
            }
        }
    }
});
