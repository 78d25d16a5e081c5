//! Pure bit-pattern default states.

use std::ptr;

/// A type with a compile-time default state.
///
/// Writing `INIT` into a slot runs no user code; it is the state a slot
/// holds after [`initialize`](super::initialize) and after being moved from.
pub trait InitState: Sized {
    const INIT: Self;
}

macro_rules! init_state {
    ($($t:ty => $v:expr),* $(,)?) => {
        $(impl InitState for $t {
            const INIT: Self = $v;
        })*
    };
}

init_state! {
    u8 => 0, u16 => 0, u32 => 0, u64 => 0, u128 => 0, usize => 0,
    i8 => 0, i16 => 0, i32 => 0, i64 => 0, i128 => 0, isize => 0,
    f32 => 0.0, f64 => 0.0,
    bool => false,
    char => '\0',
    () => (),
}

impl<T> InitState for *const T {
    const INIT: Self = ptr::null();
}

impl<T> InitState for *mut T {
    const INIT: Self = ptr::null_mut();
}

impl<T> InitState for Option<T> {
    const INIT: Self = None;
}

impl<T: InitState, const N: usize> InitState for [T; N] {
    const INIT: Self = [const { T::INIT }; N];
}

impl<A: InitState, B: InitState> InitState for (A, B) {
    const INIT: Self = (A::INIT, B::INIT);
}
