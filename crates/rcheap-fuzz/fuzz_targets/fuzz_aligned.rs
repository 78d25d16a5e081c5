#![no_main]
use libfuzzer_sys::fuzz_target;
use rcheap_core::aligned::{aligned_allocate, aligned_free, aligned_reallocate};

const ALIGNS: [usize; 6] = [1, 8, 16, 64, 512, 4096];

fn check(ptr: *mut u8, len: usize, tag: u8) {
    for i in 0..len {
        assert_eq!(unsafe { *ptr.add(i) }, tag, "byte {i} lost");
    }
}

fuzz_target!(|data: &[u8]| {
    // Each 4-byte chunk is one operation: [op, size_lo, size_hi, align_idx].
    let mut live: Vec<(*mut u8, usize, usize, u8)> = Vec::new();

    for chunk in data.chunks_exact(4) {
        let size = u16::from_le_bytes([chunk[1], chunk[2]]) as usize;
        let align = ALIGNS[chunk[3] as usize % ALIGNS.len()];
        match chunk[0] % 3 {
            0 => {
                let p = aligned_allocate(size.max(1), align);
                if p.is_null() {
                    continue;
                }
                assert_eq!(p as usize % align, 0);
                let tag = chunk[3];
                unsafe { p.write_bytes(tag, size.max(1)) };
                live.push((p, size.max(1), align, tag));
            }
            1 => {
                if let Some((p, len, align, tag)) = live.pop() {
                    let new_len = size.max(1);
                    let q = unsafe { aligned_reallocate(p, new_len, align, true) };
                    if q.is_null() {
                        live.push((p, len, align, tag));
                        continue;
                    }
                    assert_eq!(q as usize % align, 0);
                    check(q, len.min(new_len), tag);
                    unsafe { q.write_bytes(tag, new_len) };
                    live.push((q, new_len, align, tag));
                }
            }
            _ => {
                if let Some((p, len, align, tag)) = live.pop() {
                    check(p, len, tag);
                    unsafe { aligned_free(p, align) };
                }
            }
        }
    }

    for (p, _, align, _) in live {
        unsafe { aligned_free(p, align) };
    }
});
