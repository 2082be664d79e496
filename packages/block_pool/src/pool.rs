use std::num::NonZero;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::block::{self, BlockRecord, TAG_PASSTHROUGH};
use crate::error::Error;
use crate::linked_slab::{LinkedSlab, ListHead};
use crate::size_class::SizeClassTable;
use crate::sweeper::{self, Sweeper};
use crate::{BlockAllocator, BlockPoolBuilder};

/// Expectation message for taking the pool lock; the lock is only poisoned if an
/// allocator operation panicked while holding it, after which the pool state can
/// no longer be trusted.
pub(crate) const LOCK_POISONED: &str = "block pool lock poisoned by a panicked operation";

/// The free-list state shared between caller threads and the reclamation sweep.
/// One lock guards all of it collectively.
#[derive(Debug)]
pub(crate) struct PoolShared {
    /// Every live pooled block, in flight or idle. The slab key of a record is
    /// what the hidden header stores, so `release()` can find the record in O(1).
    pub(crate) registry: LinkedSlab<BlockRecord>,

    /// One free list per size class, indexed by class index. Blocks appear here
    /// only while idle, ordered oldest release first.
    pub(crate) free_lists: Vec<ListHead>,
}

/// Event counters maintained by the pool.
///
/// These live outside the lock so that passthrough operations, which must never
/// block on the pool lock, can still be counted.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) reuse_hits: AtomicU64,
    pub(crate) cold_allocations: AtomicU64,
    pub(crate) passthrough_allocations: AtomicU64,
    pub(crate) evicted_blocks: AtomicU64,
}

/// A point-in-time snapshot of pool activity, obtained from [`BlockPool::stats()`].
///
/// # Examples
///
/// ```
/// use block_pool::BlockPool;
/// use new_zealand::nz;
///
/// let pool = BlockPool::builder().build();
///
/// let ptr = pool.acquire(nz!(100));
/// // SAFETY: The pointer came from this pool and is released exactly once.
/// unsafe { pool.release(ptr) };
///
/// let stats = pool.stats();
/// assert_eq!(stats.cold_allocations, 1);
/// assert_eq!(stats.idle_blocks, 1);
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct PoolStats {
    /// Managed acquires served by reusing an idle pooled block.
    pub reuse_hits: u64,

    /// Managed acquires that had to create a new block via the system allocator.
    pub cold_allocations: u64,

    /// Acquires outside the manageable size range, forwarded to the system
    /// allocator without pooling.
    pub passthrough_allocations: u64,

    /// Pooled blocks returned to the system allocator by idle reclamation.
    pub evicted_blocks: u64,

    /// Pooled blocks currently sitting idle in free lists.
    pub idle_blocks: usize,

    /// All live pooled blocks, idle and in flight.
    pub pooled_blocks: usize,
}

/// A size-classed recycling allocator that pools released memory blocks for reuse.
///
/// The pool fronts the system allocator. Requests within the managed size range
/// are rounded up to a size class boundary and served from a per-class free list
/// when possible; releasing such a block parks it in its free list instead of
/// freeing it, so the next same-class acquire is a pointer swap rather than a trip
/// to the system allocator. Requests outside the managed range pass straight
/// through. A background thread returns blocks to the system once they have sat
/// idle past the keep-alive window.
///
/// Every returned pointer carries a hidden header, so `release()` needs no size
/// argument and runs in O(1) regardless of which path served the acquire.
///
/// # Examples
///
/// ```
/// use block_pool::BlockPool;
/// use new_zealand::nz;
///
/// let pool = BlockPool::builder().build();
///
/// let first = pool.acquire(nz!(100));
/// // SAFETY: The pointer came from this pool and is released exactly once.
/// unsafe { pool.release(first) };
///
/// // The same class is requested again, so the pooled block is reused.
/// let second = pool.acquire(nz!(100));
/// assert_eq!(first, second);
/// # // SAFETY: Still a live pointer from this pool.
/// # unsafe { pool.release(second) };
/// ```
///
/// # Thread safety
///
/// The pool is thread-safe ([`Send`] and [`Sync`]); any number of threads may
/// acquire and release concurrently. Free-list state is guarded by one
/// coarse-grained lock shared by all size classes, which managed operations take
/// briefly; passthrough operations never take it.
///
/// # Lifecycle
///
/// Dropping the pool stops and joins the reclamation thread, then returns all
/// idle blocks to the system allocator. Blocks still in flight at that point are
/// leaked deliberately: their addresses are held by callers, and those pointers
/// must not be used (including released) once the pool is gone.
#[derive(Debug)]
pub struct BlockPool {
    /// Immutable after construction; read without locking.
    classes: SizeClassTable,

    shared: Arc<Mutex<PoolShared>>,

    counters: Arc<Counters>,

    /// Origin for the second-resolution timestamps stamped on released blocks.
    epoch: Instant,

    keep_alive: Duration,

    /// `None` when the reclamation thread failed to start; see
    /// [`reclamation_error()`](Self::reclamation_error).
    sweeper: Option<Sweeper>,

    reclamation_error: Option<Error>,
}

impl BlockPool {
    /// Creates a builder for configuring and constructing a [`BlockPool`].
    ///
    /// # Examples
    ///
    /// ```
    /// use block_pool::BlockPool;
    ///
    /// let pool = BlockPool::builder().build();
    /// assert!(pool.reclamation_error().is_none());
    /// ```
    #[inline]
    pub fn builder() -> BlockPoolBuilder {
        BlockPoolBuilder::new()
    }

    pub(crate) fn new_inner(
        min_block_size: NonZero<usize>,
        max_block_size: NonZero<usize>,
        keep_alive: Duration,
        sweep_interval: Duration,
    ) -> Self {
        let classes = SizeClassTable::new(min_block_size, max_block_size);

        let shared = Arc::new(Mutex::new(PoolShared {
            registry: LinkedSlab::new(),
            free_lists: (0..classes.len()).map(|_| ListHead::new()).collect(),
        }));

        let counters = Arc::new(Counters::default());
        let epoch = Instant::now();

        let (sweeper, reclamation_error) = match Sweeper::start(
            Arc::clone(&shared),
            Arc::clone(&counters),
            epoch,
            keep_alive,
            sweep_interval,
        ) {
            Ok(sweeper) => (Some(sweeper), None),
            Err(source) => (None, Some(Error::ReclamationUnavailable { source })),
        };

        Self {
            classes,
            shared,
            counters,
            epoch,
            keep_alive,
            sweeper,
            reclamation_error,
        }
    }

    /// Acquires a block of at least `size` bytes.
    ///
    /// Sizes within the managed range are served from the size class covering
    /// them: an idle pooled block if one exists (oldest release first), otherwise
    /// a fresh block of the class boundary size. Sizes outside the range are
    /// forwarded to the system allocator and behave exactly like a direct system
    /// allocation from the caller's perspective.
    ///
    /// # Examples
    ///
    /// ```
    /// use block_pool::BlockPool;
    /// use new_zealand::nz;
    ///
    /// let pool = BlockPool::builder().build();
    ///
    /// let ptr = pool.acquire(nz!(100));
    ///
    /// // The block is yours until released; reads and writes within the
    /// // requested size are valid.
    /// // SAFETY: Freshly acquired block of at least 100 bytes.
    /// unsafe { ptr.write_bytes(0, 100) };
    ///
    /// // SAFETY: The pointer came from this pool and is released exactly once.
    /// unsafe { pool.release(ptr) };
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if the system allocator cannot satisfy an underlying request. No
    /// partial state remains in that case; nothing is reachable from any free
    /// list.
    #[must_use]
    pub fn acquire(&self, size: NonZero<usize>) -> NonNull<u8> {
        let Some(class_index) = self.classes.index_of(size.get()) else {
            self.counters
                .passthrough_allocations
                .fetch_add(1, Ordering::Relaxed);

            return block::acquire_passthrough(size);
        };

        let mut shared = self.shared.lock().expect(LOCK_POISONED);
        let PoolShared {
            registry,
            free_lists,
        } = &mut *shared;

        let free_list = free_lists
            .get_mut(class_index)
            .expect("class index from table lookup is within the free list array");

        if let Some(key) = free_list.pop_front(registry) {
            self.counters.reuse_hits.fetch_add(1, Ordering::Relaxed);

            return registry.get(key).user_ptr;
        }

        // Cold path. The system allocation happens while still holding the lock,
        // which serializes same-class block creation: two threads can never race
        // to create two blocks while one would have become available.
        let boundary = self.classes.boundary(class_index);
        let user_ptr = block::allocate_pooled(boundary);

        let key = registry.insert(BlockRecord {
            class_index,
            released_at: 0,
            user_ptr,
        });

        // SAFETY: Freshly allocated pooled memory that no one else can reach yet.
        unsafe {
            block::write_block_key(user_ptr, key);
        }

        self.counters.cold_allocations.fetch_add(1, Ordering::Relaxed);

        user_ptr
    }

    /// Releases a block previously returned by [`acquire()`](Self::acquire).
    ///
    /// A passthrough block is freed to the system allocator immediately. A pooled
    /// block is stamped with the current time and parked at the back of its size
    /// class's free list, where it stays available for reuse until the idle
    /// reclamation sweep returns it to the system.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by a prior `acquire()` on this pool and must
    /// not have been released already. Double-release, or releasing an address
    /// obtained elsewhere, is undefined behavior - the same contract as the
    /// underlying system allocator.
    pub unsafe fn release(&self, ptr: NonNull<u8>) {
        // SAFETY: The caller guarantees `ptr` is an unreleased pointer from this
        // pool, which is exactly the precondition for the header read.
        let tag = unsafe { block::read_tag(ptr) };

        if tag == TAG_PASSTHROUGH {
            // SAFETY: Tag 0 means the block came from the passthrough path;
            // forwarding the caller's single-release guarantee.
            unsafe {
                block::release_passthrough(ptr);
            }

            return;
        }

        // SAFETY: Any non-zero tag identifies a pooled block whose header carries
        // a valid registry key for as long as the block is live.
        let key = unsafe { block::read_block_key(ptr) };

        let now = self.uptime_seconds();

        let mut shared = self.shared.lock().expect(LOCK_POISONED);
        let PoolShared {
            registry,
            free_lists,
        } = &mut *shared;

        let record = registry.get_mut(key);
        record.released_at = now;
        let class_index = record.class_index;

        free_lists
            .get_mut(class_index)
            .expect("class index recorded at block creation is within the free list array")
            .push_back(registry, key);
    }

    /// Runs one idle-reclamation sweep on the calling thread.
    ///
    /// Walks each size class's free list from the least recently released end and
    /// returns every block idle longer than the keep-alive window to the system
    /// allocator. This is the same sweep the background thread runs periodically;
    /// calling it directly is useful in tests and in the degraded mode where the
    /// background thread could not be started.
    pub fn reclaim_idle(&self) {
        sweeper::sweep(
            &self.shared,
            &self.counters,
            self.uptime_seconds(),
            self.keep_alive,
        );
    }

    /// Returns the reason the background reclamation thread is not running, if it
    /// failed to start.
    ///
    /// In that degraded state the pool still works, but pooled memory only shrinks
    /// when [`reclaim_idle()`](Self::reclaim_idle) is called explicitly.
    #[must_use]
    pub fn reclamation_error(&self) -> Option<&Error> {
        self.reclamation_error.as_ref()
    }

    /// Takes a point-in-time snapshot of the pool's activity counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let shared = self.shared.lock().expect(LOCK_POISONED);

        let idle_blocks = shared.free_lists.iter().map(ListHead::len).sum();

        PoolStats {
            reuse_hits: self.counters.reuse_hits.load(Ordering::Relaxed),
            cold_allocations: self.counters.cold_allocations.load(Ordering::Relaxed),
            passthrough_allocations: self
                .counters
                .passthrough_allocations
                .load(Ordering::Relaxed),
            evicted_blocks: self.counters.evicted_blocks.load(Ordering::Relaxed),
            idle_blocks,
            pooled_blocks: shared.registry.len(),
        }
    }

    fn uptime_seconds(&self) -> u64 {
        self.epoch.elapsed().as_secs()
    }
}

impl BlockAllocator for BlockPool {
    fn acquire(&self, size: NonZero<usize>) -> NonNull<u8> {
        // Inherent method; resolves to the pooling implementation above.
        self.acquire(size)
    }

    unsafe fn release(&self, ptr: NonNull<u8>) {
        // SAFETY: Forwarding the trait contract, which matches the inherent
        // method's contract verbatim.
        unsafe {
            self.release(ptr);
        }
    }
}

impl Drop for BlockPool {
    #[cfg_attr(test, mutants::skip)] // The system allocator does not report leaked blocks.
    fn drop(&mut self) {
        // Stop and join the sweeper first so no sweep can run during or after
        // teardown of the shared state.
        drop(self.sweeper.take());

        if thread::panicking() {
            // If the thread is panicking, we are probably in a dirty state and
            // freeing pooled memory may make the problem worse by hiding the
            // original panic, so just do nothing.
            return;
        }

        let Ok(mut shared) = self.shared.lock() else {
            return;
        };

        let PoolShared {
            registry,
            free_lists,
        } = &mut *shared;

        // Return every idle block to the system. In-flight blocks stay allocated:
        // callers still hold their addresses, and by contract those pointers die
        // with the pool.
        for free_list in free_lists.iter_mut() {
            while let Some(key) = free_list.pop_back(registry) {
                let record = registry.remove(key);

                // SAFETY: The block was idle (it sat in a free list), so no caller
                // holds its pointer and the memory has not been freed before.
                unsafe {
                    block::free_pooled(record.user_ptr);
                }
            }
        }
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
    use std::fmt::Debug;
    use std::time::Duration;

    use new_zealand::nz;
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::block::TAG_POOLED;

    assert_impl_all!(BlockPool: Send, Sync, Debug);
    assert_impl_all!(PoolStats: Send, Sync, Debug);

    /// A pool whose background sweep will not interfere with deterministic tests.
    fn quiet_pool() -> BlockPool {
        BlockPool::builder()
            .sweep_interval(Duration::from_secs(3600))
            .build()
    }

    #[test]
    fn fresh_pool_has_zeroed_stats() {
        let pool = quiet_pool();
        let stats = pool.stats();

        assert_eq!(stats.reuse_hits, 0);
        assert_eq!(stats.cold_allocations, 0);
        assert_eq!(stats.passthrough_allocations, 0);
        assert_eq!(stats.evicted_blocks, 0);
        assert_eq!(stats.idle_blocks, 0);
        assert_eq!(stats.pooled_blocks, 0);
    }

    #[test]
    fn released_block_is_reused_at_the_same_address() {
        let pool = quiet_pool();

        let first = pool.acquire(nz!(100));
        unsafe { pool.release(first) };

        let second = pool.acquire(nz!(100));
        assert_eq!(first, second);

        let stats = pool.stats();
        assert_eq!(stats.cold_allocations, 1);
        assert_eq!(stats.reuse_hits, 1);

        unsafe { pool.release(second) };
    }

    #[test]
    fn same_class_sizes_share_blocks() {
        let pool = quiet_pool();

        // 100 and 112 both map to the class with boundary 112.
        let first = pool.acquire(nz!(100));
        unsafe { pool.release(first) };

        let second = pool.acquire(nz!(112));
        assert_eq!(first, second);

        unsafe { pool.release(second) };
    }

    #[test]
    fn pooled_header_carries_tag_and_smallest_covering_class() {
        let pool = quiet_pool();

        let ptr = pool.acquire(nz!(100));

        let tag = unsafe { block::read_tag(ptr) };
        assert_eq!(tag, TAG_POOLED);

        let key = unsafe { block::read_block_key(ptr) };
        let class_index = {
            let shared = pool.shared.lock().unwrap();
            shared.registry.get(key).class_index
        };

        // Boundary 112 covers 100 and is the smallest class that does.
        assert_eq!(pool.classes.boundary(class_index), 112);
        assert!(pool.classes.boundary(class_index - 1) < 100);

        unsafe { pool.release(ptr) };
    }

    #[test]
    fn unmanaged_sizes_never_touch_the_pool() {
        let pool = quiet_pool();

        // Below the minimum and above the maximum.
        for size in [nz!(1), nz!(63), nz!(2_000_000_000)] {
            let ptr = pool.acquire(size);

            let tag = unsafe { block::read_tag(ptr) };
            assert_eq!(tag, TAG_PASSTHROUGH);

            unsafe { pool.release(ptr) };
        }

        let stats = pool.stats();
        assert_eq!(stats.passthrough_allocations, 3);
        assert_eq!(stats.cold_allocations, 0);
        assert_eq!(stats.reuse_hits, 0);
        assert_eq!(stats.idle_blocks, 0);
        assert_eq!(stats.pooled_blocks, 0);
    }

    #[test]
    fn boundary_sizes_split_between_pool_and_passthrough() {
        let pool = quiet_pool();

        // Exactly the minimum is managed; one byte less is not.
        let managed = pool.acquire(nz!(64));
        let unmanaged = pool.acquire(nz!(63));

        assert_eq!(unsafe { block::read_tag(managed) }, TAG_POOLED);
        assert_eq!(unsafe { block::read_tag(unmanaged) }, TAG_PASSTHROUGH);

        unsafe { pool.release(managed) };
        unsafe { pool.release(unmanaged) };
    }

    #[test]
    fn blocks_are_reused_in_release_order() {
        let pool = quiet_pool();

        let first = pool.acquire(nz!(100));
        let second = pool.acquire(nz!(100));
        assert_ne!(first, second);

        unsafe { pool.release(first) };
        unsafe { pool.release(second) };

        // Oldest release comes back first.
        assert_eq!(pool.acquire(nz!(100)), first);
        assert_eq!(pool.acquire(nz!(100)), second);

        unsafe { pool.release(first) };
        unsafe { pool.release(second) };
    }

    #[test]
    fn in_flight_blocks_are_not_idle() {
        let pool = quiet_pool();

        let ptr = pool.acquire(nz!(100));

        let stats = pool.stats();
        assert_eq!(stats.pooled_blocks, 1);
        assert_eq!(stats.idle_blocks, 0);

        unsafe { pool.release(ptr) };

        let stats = pool.stats();
        assert_eq!(stats.pooled_blocks, 1);
        assert_eq!(stats.idle_blocks, 1);
    }

    #[test]
    fn user_data_survives_the_round_trip() {
        let pool = quiet_pool();

        let ptr = pool.acquire(nz!(100));

        unsafe {
            for offset in 0..100 {
                #[allow(clippy::cast_possible_truncation, reason = "offsets fit in u8")]
                ptr.add(offset).write(offset as u8);
            }

            for offset in 0..100 {
                #[allow(clippy::cast_possible_truncation, reason = "offsets fit in u8")]
                let expected = offset as u8;
                assert_eq!(ptr.add(offset).read(), expected);
            }
        }

        unsafe { pool.release(ptr) };
    }

    #[test]
    fn expired_blocks_are_reclaimed() {
        let pool = BlockPool::builder()
            .keep_alive(Duration::ZERO)
            .sweep_interval(Duration::from_secs(3600))
            .build();

        let ptr = pool.acquire(nz!(100));
        unsafe { pool.release(ptr) };

        pool.reclaim_idle();

        let stats = pool.stats();
        assert_eq!(stats.evicted_blocks, 1);
        assert_eq!(stats.idle_blocks, 0);
        assert_eq!(stats.pooled_blocks, 0);

        // The next acquire cannot be a reuse; the pool is empty again.
        let fresh = pool.acquire(nz!(100));
        assert_eq!(pool.stats().cold_allocations, 2);

        unsafe { pool.release(fresh) };
    }

    #[test]
    fn fresh_blocks_survive_the_sweep() {
        // Default keep-alive is far longer than this test.
        let pool = quiet_pool();

        let ptr = pool.acquire(nz!(100));
        unsafe { pool.release(ptr) };

        pool.reclaim_idle();

        let stats = pool.stats();
        assert_eq!(stats.evicted_blocks, 0);
        assert_eq!(stats.idle_blocks, 1);

        // Still the same block on reuse.
        assert_eq!(pool.acquire(nz!(100)), ptr);
        unsafe { pool.release(ptr) };
    }

    #[test]
    fn background_sweep_reclaims_without_help() {
        let pool = BlockPool::builder()
            .keep_alive(Duration::ZERO)
            .sweep_interval(Duration::from_millis(10))
            .build();

        assert!(pool.reclamation_error().is_none());

        let ptr = pool.acquire(nz!(100));
        unsafe { pool.release(ptr) };

        // Give the background thread a few sweep periods to notice the block.
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.stats().evicted_blocks == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(pool.stats().evicted_blocks, 1);
        assert_eq!(pool.stats().idle_blocks, 0);
    }

    #[test]
    fn distinct_classes_use_distinct_free_lists() {
        let pool = quiet_pool();

        let small = pool.acquire(nz!(100));
        let large = pool.acquire(nz!(1000));
        unsafe { pool.release(small) };
        unsafe { pool.release(large) };

        // A request in the small class must not be served by the large block.
        let reused = pool.acquire(nz!(100));
        assert_eq!(reused, small);
        assert_ne!(reused, large);

        unsafe { pool.release(reused) };
    }

    #[test]
    fn drop_with_idle_blocks_returns_them() {
        let pool = quiet_pool();

        for _ in 0..10 {
            let ptr = pool.acquire(nz!(100));
            unsafe { pool.release(ptr) };
        }

        // Dropping must stop the sweeper and free the idle block without issue.
        drop(pool);
    }

    #[test]
    fn drop_with_in_flight_blocks_does_not_free_them() {
        let pool = quiet_pool();

        let ptr = pool.acquire(nz!(100));

        // The block is deliberately leaked; freeing it would invalidate `ptr`
        // while the caller still holds it.
        drop(pool);

        // The memory is still there; writing is fine even though the pool is gone.
        unsafe { ptr.write_bytes(0xCD, 100) };
    }

    #[test]
    fn works_through_the_allocator_trait() {
        fn exercise(allocator: &dyn BlockAllocator) {
            let ptr = allocator.acquire(nz!(100));
            unsafe { allocator.release(ptr) };
        }

        let pool = quiet_pool();
        exercise(&pool);

        assert_eq!(pool.stats().cold_allocations, 1);
    }

    #[test]
    fn configured_range_shapes_the_class_table() {
        let pool = BlockPool::builder()
            .min_block_size(nz!(64))
            .max_block_size(nz!(1024))
            .build();

        // 64, 112, 128, 224, 256, 448, 512, 896, 1024.
        assert_eq!(pool.classes.len(), 9);
    }
}
