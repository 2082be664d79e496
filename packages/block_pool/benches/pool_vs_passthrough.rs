//! Benchmarks comparing pooled reuse against direct system allocation.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::time::Duration;

use block_pool::{BlockAllocator, BlockPool, PassthroughAllocator};
use criterion::{Criterion, criterion_group, criterion_main};
use new_zealand::nz;

criterion_group!(benches, entrypoint);
criterion_main!(benches);

const BLOCK_SIZE: std::num::NonZero<usize> = nz!(1024);

/// A pool whose background sweep stays out of the measurement.
fn quiet_pool() -> BlockPool {
    BlockPool::builder()
        .sweep_interval(Duration::from_secs(3600))
        .build()
}

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("round_trip");

    group.bench_function("pool_warm", |b| {
        let pool = quiet_pool();

        // Prime the free list so every measured acquire is a reuse hit.
        let primer = pool.acquire(BLOCK_SIZE);
        // SAFETY: The pointer came from this pool and is released exactly once.
        unsafe { pool.release(primer) };

        b.iter(|| {
            let ptr = black_box(pool.acquire(BLOCK_SIZE));
            // SAFETY: The pointer came from this pool and is released exactly once.
            unsafe { pool.release(ptr) };
        });
    });

    group.bench_function("pool_unmanaged", |b| {
        let pool = BlockPool::builder()
            .max_block_size(nz!(512))
            .sweep_interval(Duration::from_secs(3600))
            .build();

        // 1024 exceeds the managed range, so this measures the passthrough path
        // including its header bookkeeping.
        b.iter(|| {
            let ptr = black_box(pool.acquire(BLOCK_SIZE));
            // SAFETY: The pointer came from this pool and is released exactly once.
            unsafe { pool.release(ptr) };
        });
    });

    group.bench_function("system", |b| {
        let allocator = PassthroughAllocator;

        b.iter(|| {
            let ptr = black_box(allocator.acquire(BLOCK_SIZE));
            // SAFETY: The pointer came from this allocator and is released
            // exactly once.
            unsafe { allocator.release(ptr) };
        });
    });

    group.finish();

    let mut group = c.benchmark_group("round_trip_batched");

    group.bench_function("pool_warm_100", |b| {
        let pool = quiet_pool();
        let mut held = Vec::with_capacity(100);

        // Prime 100 blocks so the batch never goes cold.
        for _ in 0..100 {
            held.push(pool.acquire(BLOCK_SIZE));
        }
        for ptr in held.drain(..) {
            // SAFETY: The pointer came from this pool and is released exactly once.
            unsafe { pool.release(ptr) };
        }

        b.iter(|| {
            for _ in 0..100 {
                held.push(black_box(pool.acquire(BLOCK_SIZE)));
            }

            for ptr in held.drain(..) {
                // SAFETY: The pointer came from this pool and is released
                // exactly once.
                unsafe { pool.release(ptr) };
            }
        });
    });

    group.bench_function("system_100", |b| {
        let allocator = PassthroughAllocator;
        let mut held = Vec::with_capacity(100);

        b.iter(|| {
            for _ in 0..100 {
                held.push(black_box(allocator.acquire(BLOCK_SIZE)));
            }

            for ptr in held.drain(..) {
                // SAFETY: The pointer came from this allocator and is released
                // exactly once.
                unsafe { allocator.release(ptr) };
            }
        });
    });

    group.finish();
}
