//! Arbitrary-alignment allocation on top of the raw hook allocator.
//!
//! Layout of an aligned block (`W` = pointer width):
//!
//! ```text
//! raw                         aligned - 2W     aligned
//! |<-- padding (0..align-1) -->|  raw  | size  |<-- size bytes -->|<-- slack -->|
//! ```
//!
//! The raw request is `size + align - 1 + 2W`. The two header words hold the
//! pointer the raw allocator returned and the size originally requested, so
//! free and reallocate can recover the raw block from the aligned address.
//! The same `align` must be passed to every call on one block; alignment 1
//! bypasses the header entirely and goes straight to the raw hooks.

#![allow(unsafe_code)]

use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};

use rcheap_membrane::config::{self, ReallocPolicy};
use rcheap_membrane::hooks;
use rcheap_membrane::log::{self, LogLevel, LogRecord};

/// Bytes of bookkeeping stored right before an aligned address.
pub const HEADER_SIZE: usize = 2 * size_of::<usize>();

struct AlignedCounters {
    allocations: AtomicU64,
    frees: AtomicU64,
    reallocs_in_place: AtomicU64,
    reallocs_moved: AtomicU64,
    failures: AtomicU64,
}

static COUNTERS: AlignedCounters = AlignedCounters {
    allocations: AtomicU64::new(0),
    frees: AtomicU64::new(0),
    reallocs_in_place: AtomicU64::new(0),
    reallocs_moved: AtomicU64::new(0),
    failures: AtomicU64::new(0),
};

/// Snapshot of process-wide aligned allocator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlignedStats {
    pub allocations: u64,
    pub frees: u64,
    /// Reallocations that kept their block.
    pub reallocs_in_place: u64,
    /// Reallocations that moved to a new block.
    pub reallocs_moved: u64,
    /// Requests that returned null.
    pub failures: u64,
}

#[must_use]
pub fn aligned_stats() -> AlignedStats {
    AlignedStats {
        allocations: COUNTERS.allocations.load(Ordering::Relaxed),
        frees: COUNTERS.frees.load(Ordering::Relaxed),
        reallocs_in_place: COUNTERS.reallocs_in_place.load(Ordering::Relaxed),
        reallocs_moved: COUNTERS.reallocs_moved.load(Ordering::Relaxed),
        failures: COUNTERS.failures.load(Ordering::Relaxed),
    }
}

/// Raw bytes needed to serve `size` bytes at `alignment`, or `None` on
/// overflow. Alignment 1 needs no header.
#[must_use]
pub const fn aligned_request(size: usize, alignment: usize) -> Option<usize> {
    if alignment <= 1 {
        return Some(size);
    }
    match size.checked_add(alignment - 1) {
        Some(padded) => padded.checked_add(HEADER_SIZE),
        None => None,
    }
}

#[inline]
fn valid_alignment(alignment: usize) -> bool {
    alignment.is_power_of_two()
}

fn reject_alignment(alignment: usize, size: usize) -> *mut u8 {
    debug_assert!(
        valid_alignment(alignment),
        "alignment {alignment} is not a power of two"
    );
    COUNTERS.failures.fetch_add(1, Ordering::Relaxed);
    log::emit(
        LogRecord::new(LogLevel::Error, "aligned", "invalid_alignment")
            .with_size(size)
            .with_align(alignment)
            .with_outcome("null"),
    );
    std::ptr::null_mut()
}

fn note_failure(event: &'static str, size: usize, alignment: usize) {
    COUNTERS.failures.fetch_add(1, Ordering::Relaxed);
    if log::enabled(LogLevel::Warn) {
        log::emit(
            LogRecord::new(LogLevel::Warn, "aligned", event)
                .with_size(size)
                .with_align(alignment)
                .with_outcome("null"),
        );
    }
}

/// Header words of an aligned block: `(raw, requested_size)`.
///
/// # Safety
/// `aligned` must be a live block from [`aligned_allocate`] with `alignment > 1`.
#[inline]
unsafe fn read_header(aligned: *mut u8) -> (*mut u8, usize) {
    // SAFETY: the header occupies the 2W bytes before `aligned`, inside the
    // raw block; it may be under-aligned for small alignments.
    unsafe {
        let header = aligned.sub(HEADER_SIZE);
        let raw = header.cast::<*mut u8>().read_unaligned();
        let size = header
            .add(size_of::<usize>())
            .cast::<usize>()
            .read_unaligned();
        (raw, size)
    }
}

#[inline]
unsafe fn write_header(aligned: *mut u8, raw: *mut u8, size: usize) {
    // SAFETY: see `read_header`.
    unsafe {
        let header = aligned.sub(HEADER_SIZE);
        header.cast::<*mut u8>().write_unaligned(raw);
        header
            .add(size_of::<usize>())
            .cast::<usize>()
            .write_unaligned(size);
    }
}

#[inline]
fn debug_check_block(aligned: *mut u8, raw: *mut u8, alignment: usize) {
    let offset = (aligned as usize).wrapping_sub(raw as usize);
    debug_assert!(
        (aligned as usize) % alignment == 0,
        "block {aligned:p} is not aligned to {alignment}; alignment differs from allocation"
    );
    debug_assert!(
        (HEADER_SIZE..HEADER_SIZE + alignment).contains(&offset),
        "block {aligned:p} header is inconsistent with alignment {alignment}"
    );
}

/// Allocate `size` bytes whose address is a multiple of `alignment`.
///
/// Returns null when the raw allocator fails, when the request overflows, or
/// when `alignment` is not a power of two (which also trips a debug
/// assertion).
#[must_use]
pub fn aligned_allocate(size: usize, alignment: usize) -> *mut u8 {
    let p = allocate_block(size, alignment);
    if !p.is_null() {
        COUNTERS.allocations.fetch_add(1, Ordering::Relaxed);
    }
    p
}

fn allocate_block(size: usize, alignment: usize) -> *mut u8 {
    if !valid_alignment(alignment) {
        return reject_alignment(alignment, size);
    }
    if alignment == 1 {
        let raw = hooks::allocate(size);
        if raw.is_null() {
            note_failure("alloc_failed", size, alignment);
        }
        return raw;
    }
    let Some(request) = aligned_request(size, alignment) else {
        note_failure("request_overflow", size, alignment);
        return std::ptr::null_mut();
    };
    let raw = hooks::allocate(request);
    if raw.is_null() {
        note_failure("alloc_failed", size, alignment);
        return raw;
    }
    let start = raw as usize + HEADER_SIZE;
    let aligned_addr = (start + alignment - 1) & !(alignment - 1);
    let aligned = raw.wrapping_add(aligned_addr - raw as usize);
    // SAFETY: aligned_addr - raw <= HEADER_SIZE + alignment - 1, so the header
    // and `size` user bytes all lie inside the `request`-byte raw block.
    unsafe { write_header(aligned, raw, size) };
    aligned
}

/// Bytes addressable from `aligned` to the end of its raw block.
///
/// `None` for null or for alignment 1 (the raw allocator does not expose
/// block sizes).
///
/// # Safety
/// `aligned` must be null or a live block allocated with `alignment`.
#[must_use]
pub unsafe fn aligned_usable_size(aligned: *mut u8, alignment: usize) -> Option<usize> {
    if aligned.is_null() || alignment <= 1 {
        return None;
    }
    // SAFETY: forwarded caller contract.
    let (raw, size) = unsafe { read_header(aligned) };
    debug_check_block(aligned, raw, alignment);
    Some(usable_capacity(raw, aligned, size, alignment))
}

#[inline]
fn usable_capacity(raw: *mut u8, aligned: *mut u8, size: usize, alignment: usize) -> usize {
    let request = aligned_request(size, alignment).unwrap_or(size);
    request - (aligned as usize - raw as usize)
}

/// Reallocate with the process-wide [`ReallocPolicy`].
///
/// # Safety
/// See [`aligned_reallocate_with`].
#[must_use]
pub unsafe fn aligned_reallocate(
    aligned: *mut u8,
    new_size: usize,
    alignment: usize,
    preserve_contents: bool,
) -> *mut u8 {
    // SAFETY: forwarded caller contract.
    unsafe {
        aligned_reallocate_with(
            aligned,
            new_size,
            alignment,
            preserve_contents,
            config::realloc_policy(),
        )
    }
}

/// Resize an aligned block.
///
/// - alignment 1 delegates to the raw reallocator (which always preserves);
/// - null delegates to [`aligned_allocate`];
/// - a request inside the policy's reuse window that still fits the current
///   raw block returns `aligned` unchanged;
/// - otherwise a new block is allocated, the old contents are copied when
///   `preserve_contents` is set, and the old block is freed.
///
/// Copying covers `min(usable capacity, new_size)` bytes, so data written
/// after an earlier in-place growth survives the move. On failure null is
/// returned and the old block is left untouched.
///
/// # Safety
/// `aligned` must be null or a live block allocated with the same
/// `alignment`. On success the old address must no longer be used unless it
/// was returned.
#[must_use]
pub unsafe fn aligned_reallocate_with(
    aligned: *mut u8,
    new_size: usize,
    alignment: usize,
    preserve_contents: bool,
    policy: ReallocPolicy,
) -> *mut u8 {
    if !valid_alignment(alignment) {
        return reject_alignment(alignment, new_size);
    }
    if alignment == 1 {
        // SAFETY: forwarded caller contract.
        let p = unsafe { hooks::reallocate(aligned, new_size) };
        if p.is_null() {
            note_failure("realloc_failed", new_size, alignment);
        } else if aligned.is_null() {
            COUNTERS.allocations.fetch_add(1, Ordering::Relaxed);
        } else if p == aligned {
            COUNTERS.reallocs_in_place.fetch_add(1, Ordering::Relaxed);
        } else {
            COUNTERS.reallocs_moved.fetch_add(1, Ordering::Relaxed);
        }
        return p;
    }
    if aligned.is_null() {
        return aligned_allocate(new_size, alignment);
    }

    // SAFETY: forwarded caller contract.
    let (raw, prev_size) = unsafe { read_header(aligned) };
    debug_check_block(aligned, raw, alignment);
    let prev_request = aligned_request(prev_size, alignment).unwrap_or(usize::MAX);
    let Some(new_request) = aligned_request(new_size, alignment) else {
        note_failure("request_overflow", new_size, alignment);
        return std::ptr::null_mut();
    };
    let capacity = usable_capacity(raw, aligned, prev_size, alignment);

    if policy.in_reuse_window(prev_request, new_request) && new_size <= capacity {
        COUNTERS.reallocs_in_place.fetch_add(1, Ordering::Relaxed);
        if log::enabled(LogLevel::Trace) {
            log::emit(
                LogRecord::new(LogLevel::Trace, "aligned", "realloc_reuse")
                    .with_ptr(aligned)
                    .with_size(new_size)
                    .with_align(alignment)
                    .with_details(format!(
                        "prev_request={prev_request} new_request={new_request} capacity={capacity}"
                    )),
            );
        }
        return aligned;
    }

    let fresh = allocate_block(new_size, alignment);
    if fresh.is_null() {
        return fresh;
    }
    COUNTERS.reallocs_moved.fetch_add(1, Ordering::Relaxed);
    if preserve_contents {
        let n = capacity.min(new_size);
        // SAFETY: both blocks are valid for `n` bytes and distinct.
        unsafe { hooks::copy(fresh, aligned, n) };
    }
    // SAFETY: `raw` is the live raw block behind `aligned`.
    unsafe { hooks::free(raw) };
    if log::enabled(LogLevel::Debug) {
        log::emit(
            LogRecord::new(LogLevel::Debug, "aligned", "realloc_move")
                .with_ptr(fresh)
                .with_size(new_size)
                .with_align(alignment)
                .with_details(format!(
                    "from={aligned:p} prev_size={prev_size} preserved={preserve_contents}"
                )),
        );
    }
    fresh
}

/// Release an aligned block. Null is a no-op.
///
/// # Safety
/// `aligned` must be null or a live block allocated with the same
/// `alignment`, and is freed exactly once.
pub unsafe fn aligned_free(aligned: *mut u8, alignment: usize) {
    if aligned.is_null() {
        return;
    }
    if !valid_alignment(alignment) {
        reject_alignment(alignment, 0);
        return;
    }
    COUNTERS.frees.fetch_add(1, Ordering::Relaxed);
    if alignment == 1 {
        // SAFETY: forwarded caller contract.
        unsafe { hooks::free(aligned) };
        return;
    }
    // SAFETY: forwarded caller contract.
    let (raw, _) = unsafe { read_header(aligned) };
    debug_check_block(aligned, raw, alignment);
    // SAFETY: `raw` is the block the raw allocator returned.
    unsafe { hooks::free(raw) };
}
