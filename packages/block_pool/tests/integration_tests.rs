//! Concurrency integration tests for `block_pool`.
//!
//! These tests exercise the pool from multiple threads at once and verify that
//! no two threads ever observe the same block as simultaneously live.

use std::collections::HashSet;
use std::num::NonZero;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use block_pool::BlockPool;
use new_zealand::nz;

const THREADS: usize = 8;
const ROUNDS: usize = 200;

#[test]
fn pool_can_be_shared_across_threads() {
    let pool = Arc::new(BlockPool::builder().build());

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let pool = Arc::clone(&pool);

            thread::spawn(move || {
                for _ in 0..ROUNDS {
                    let ptr = pool.acquire(nz!(100));

                    // SAFETY: Freshly acquired block of at least 100 bytes.
                    unsafe { ptr.write_bytes(0xAB, 100) };

                    // SAFETY: The pointer came from this pool and is released
                    // exactly once.
                    unsafe { pool.release(ptr) };
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let stats = pool.stats();
    assert_eq!(
        stats.reuse_hits + stats.cold_allocations,
        (THREADS * ROUNDS) as u64
    );
}

#[test]
fn concurrent_acquires_never_alias() {
    let pool = Arc::new(
        BlockPool::builder()
            .sweep_interval(Duration::from_secs(3600))
            .build(),
    );
    let live = Arc::new(Mutex::new(HashSet::new()));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let live = Arc::clone(&live);
            let barrier = Arc::clone(&barrier);

            thread::spawn(move || {
                barrier.wait();

                for round in 0..ROUNDS {
                    // A spread of sizes so multiple classes see contention.
                    let size = NonZero::new(64 + (round % 5) * 100).unwrap();

                    let ptr = pool.acquire(size);

                    // While we hold the block, its address must not be live
                    // anywhere else.
                    let address = ptr.as_ptr() as usize;
                    assert!(
                        live.lock().unwrap().insert(address),
                        "two threads held block {address:#x} at the same time"
                    );

                    // SAFETY: We hold the only reference to this block.
                    unsafe { ptr.write_bytes(0x5A, size.get()) };

                    assert!(live.lock().unwrap().remove(&address));

                    // SAFETY: The pointer came from this pool and is released
                    // exactly once.
                    unsafe { pool.release(ptr) };
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn background_reclamation_coexists_with_traffic() {
    // An aggressive configuration so sweeps race with acquire/release traffic.
    let pool = Arc::new(
        BlockPool::builder()
            .keep_alive(Duration::ZERO)
            .sweep_interval(Duration::from_millis(1))
            .build(),
    );

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let pool = Arc::clone(&pool);

            thread::spawn(move || {
                for _ in 0..ROUNDS {
                    let ptr = pool.acquire(nz!(100));

                    // SAFETY: Freshly acquired block of at least 100 bytes.
                    unsafe { ptr.write_bytes(0xEE, 100) };

                    // SAFETY: The pointer came from this pool and is released
                    // exactly once.
                    unsafe { pool.release(ptr) };
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    // Every block the threads created was either evicted or still sits idle.
    let stats = pool.stats();
    assert_eq!(
        stats.cold_allocations,
        stats.evicted_blocks + stats.idle_blocks as u64
    );
}

#[test]
fn dropping_a_busy_pool_is_clean() {
    let pool = Arc::new(
        BlockPool::builder()
            .keep_alive(Duration::ZERO)
            .sweep_interval(Duration::from_millis(1))
            .build(),
    );

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let pool = Arc::clone(&pool);

            thread::spawn(move || {
                for _ in 0..ROUNDS {
                    let ptr = pool.acquire(nz!(100));

                    // SAFETY: The pointer came from this pool and is released
                    // exactly once.
                    unsafe { pool.release(ptr) };
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    // The last Arc drop tears down the sweeper and frees the idle blocks.
    drop(pool);
}
