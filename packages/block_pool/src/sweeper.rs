use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::block;
use crate::pool::{Counters, LOCK_POISONED, PoolShared};

/// The background thread that periodically returns idle blocks to the system
/// allocator.
///
/// Dropping the sweeper signals the thread to stop and joins it, so after the
/// drop completes no further sweep will run.
#[derive(Debug)]
pub(crate) struct Sweeper {
    /// Any message (or the sender disconnecting) stops the thread.
    shutdown_tx: mpsc::Sender<()>,

    join_handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Spawns the reclamation thread. Fails only if the OS refuses to create a
    /// thread, in which case the pool keeps working without background sweeps.
    pub(crate) fn start(
        shared: Arc<Mutex<PoolShared>>,
        counters: Arc<Counters>,
        epoch: Instant,
        keep_alive: Duration,
        sweep_interval: Duration,
    ) -> std::io::Result<Self> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join_handle = thread::Builder::new()
            .name("block_pool_sweeper".to_string())
            .spawn(move || {
                loop {
                    match shutdown_rx.recv_timeout(sweep_interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            sweep(&shared, &counters, epoch.elapsed().as_secs(), keep_alive);
                        }
                        // A shutdown message, or the pool vanished without
                        // sending one. Either way, stop sweeping.
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
            })?;

        Ok(Self {
            shutdown_tx,
            join_handle: Some(join_handle),
        })
    }
}

impl Drop for Sweeper {
    #[cfg_attr(test, mutants::skip)] // Impractical to test that sweeps stop happening.
    fn drop(&mut self) {
        if thread::panicking() {
            // If the thread is panicking, we are probably in a dirty state and
            // cannot rely on the shutdown handshake completing, so just do
            // nothing and let the channel disconnect stop the thread.
            return;
        }

        self.shutdown_tx
            .send(())
            .expect("sweeper thread stopped before being asked to");

        self.join_handle
            .take()
            .expect("sweeper can only be dropped once")
            .join()
            .expect("sweeper thread panicked");
    }
}

/// Returns every block that has been idle for at least the keep-alive window to
/// the system allocator.
///
/// Each free list is ordered oldest release first, so the walk starts at the
/// front and stops at the first block still within its keep-alive window; every
/// block behind it is necessarily fresher.
pub(crate) fn sweep(
    shared: &Mutex<PoolShared>,
    counters: &Counters,
    now: u64,
    keep_alive: Duration,
) {
    let mut shared = shared.lock().expect(LOCK_POISONED);
    let PoolShared {
        registry,
        free_lists,
    } = &mut *shared;

    let mut evicted = 0;

    for free_list in free_lists.iter_mut() {
        while let Some(key) = free_list.front() {
            let released_at = registry.get(key).released_at;

            // Saturating because a sweep may observe `now` slightly behind a
            // release stamp taken on another thread.
            if now.saturating_sub(released_at) < keep_alive.as_secs() {
                break;
            }

            free_list.unlink(registry, key);
            let record = registry.remove(key);

            // SAFETY: The block was idle (it sat in a free list), so no caller
            // holds its pointer and the memory has not been freed before.
            unsafe {
                block::free_pooled(record.user_ptr);
            }

            evicted += 1;
        }
    }

    if evicted > 0 {
        counters.evicted_blocks.fetch_add(evicted, Ordering::Relaxed);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use super::*;
    use crate::block::BlockRecord;
    use crate::linked_slab::{LinkedSlab, ListHead};

    /// Builds shared state with one class whose free list holds blocks released
    /// at the given timestamps, oldest first.
    fn shared_with_idle_blocks(released_at: &[u64]) -> Mutex<PoolShared> {
        let mut registry = LinkedSlab::new();
        let mut free_list = ListHead::new();

        for &released_at in released_at {
            let user_ptr = block::allocate_pooled(64);

            let key = registry.insert(BlockRecord {
                class_index: 0,
                released_at,
                user_ptr,
            });

            unsafe {
                block::write_block_key(user_ptr, key);
            }

            free_list.push_back(&mut registry, key);
        }

        Mutex::new(PoolShared {
            registry,
            free_lists: vec![free_list],
        })
    }

    fn drain(shared: &Mutex<PoolShared>) {
        let mut shared = shared.lock().unwrap();
        let PoolShared {
            registry,
            free_lists,
        } = &mut *shared;

        for free_list in free_lists.iter_mut() {
            while let Some(key) = free_list.pop_front(registry) {
                let record = registry.remove(key);

                unsafe {
                    block::free_pooled(record.user_ptr);
                }
            }
        }
    }

    #[test]
    fn expired_blocks_are_freed() {
        let shared = shared_with_idle_blocks(&[0, 0, 0]);
        let counters = Counters::default();

        sweep(&shared, &counters, 100, Duration::from_secs(15));

        assert_eq!(counters.evicted_blocks.load(Ordering::Relaxed), 3);

        let guard = shared.lock().unwrap();
        assert_eq!(guard.registry.len(), 0);
        assert!(guard.free_lists[0].is_empty());
    }

    #[test]
    fn fresh_blocks_are_kept() {
        let shared = shared_with_idle_blocks(&[99, 100]);
        let counters = Counters::default();

        sweep(&shared, &counters, 100, Duration::from_secs(15));

        assert_eq!(counters.evicted_blocks.load(Ordering::Relaxed), 0);
        assert_eq!(shared.lock().unwrap().registry.len(), 2);

        drain(&shared);
    }

    #[test]
    fn walk_stops_at_the_first_fresh_block() {
        // Oldest first: two expired, then one fresh.
        let shared = shared_with_idle_blocks(&[0, 10, 95]);
        let counters = Counters::default();

        sweep(&shared, &counters, 100, Duration::from_secs(15));

        assert_eq!(counters.evicted_blocks.load(Ordering::Relaxed), 2);

        {
            let guard = shared.lock().unwrap();
            assert_eq!(guard.registry.len(), 1);
            assert_eq!(guard.free_lists[0].len(), 1);
        }

        drain(&shared);
    }

    #[test]
    fn keep_alive_boundary_is_inclusive() {
        // Exactly keep-alive seconds old: evicted.
        let shared = shared_with_idle_blocks(&[85]);
        let counters = Counters::default();

        sweep(&shared, &counters, 100, Duration::from_secs(15));

        assert_eq!(counters.evicted_blocks.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn timestamps_ahead_of_now_are_tolerated() {
        let shared = shared_with_idle_blocks(&[101]);
        let counters = Counters::default();

        sweep(&shared, &counters, 100, Duration::from_secs(15));

        assert_eq!(counters.evicted_blocks.load(Ordering::Relaxed), 0);

        drain(&shared);
    }

    #[test]
    fn empty_pool_sweeps_cleanly() {
        let shared = shared_with_idle_blocks(&[]);
        let counters = Counters::default();

        sweep(&shared, &counters, 100, Duration::from_secs(15));

        assert_eq!(counters.evicted_blocks.load(Ordering::Relaxed), 0);
    }
}
