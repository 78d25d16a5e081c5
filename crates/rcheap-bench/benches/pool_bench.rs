//! Autorelease pool benchmarks.

use std::ffi::c_void;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rcheap_core::pool::{self, PoolStack};

unsafe fn release_nothing(item: *mut c_void) {
    criterion::black_box(item);
}

fn bench_push_pop(c: &mut Criterion) {
    let entries: &[usize] = &[0, 8, 128, 1024];
    let mut group = c.benchmark_group("pool_push_pop");
    let stack = PoolStack::new();

    for &n in entries {
        group.bench_with_input(BenchmarkId::new("explicit_stack", n), &n, |b, &n| {
            b.iter(|| {
                let handle = stack.push();
                for i in 0..n {
                    let _ = stack.register_for_release(i as *mut c_void, release_nothing);
                }
                stack.pop(handle);
            });
        });
        group.bench_with_input(BenchmarkId::new("thread_default", n), &n, |b, &n| {
            b.iter(|| {
                pool::autoreleasepool(|| {
                    for i in 0..n {
                        let _ = pool::register_for_release(i as *mut c_void, release_nothing);
                    }
                });
            });
        });
    }
    group.finish();
}

fn bench_autorelease_values(c: &mut Criterion) {
    c.bench_function("pool_autorelease_64_strings", |b| {
        b.iter(|| {
            pool::autoreleasepool(|| {
                for i in 0..64 {
                    let _ = pool::autorelease(i.to_string());
                }
            });
        });
    });
}

criterion_group!(benches, bench_push_pop, bench_autorelease_values);
criterion_main!(benches);
