use std::cell::Cell;
use std::marker::PhantomData;
use std::num::NonZero;
use std::time::Duration;

use new_zealand::nz;

use crate::BlockPool;

/// Smallest request size the pool manages by default; anything below is passed
/// straight to the system allocator.
pub(crate) const DEFAULT_MIN_BLOCK_SIZE: NonZero<usize> = nz!(64);

/// Largest request size the pool manages by default (1 GiB).
pub(crate) const DEFAULT_MAX_BLOCK_SIZE: NonZero<usize> = nz!(1_073_741_824);

/// How long a released block may sit idle before it becomes eligible for
/// reclamation.
pub(crate) const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(15);

/// How often the background sweep looks for idle blocks to reclaim.
pub(crate) const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(2);

/// Builder for configuring and constructing a [`BlockPool`].
///
/// All settings are optional; the defaults match the pool's intended use of
/// fronting steady, size-stable allocation traffic (manage 64 bytes to 1 GiB,
/// keep idle blocks for 15 seconds, sweep every 2 seconds).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use block_pool::BlockPool;
/// use new_zealand::nz;
///
/// let pool = BlockPool::builder()
///     .min_block_size(nz!(32))
///     .max_block_size(nz!(65_536))
///     .keep_alive(Duration::from_secs(30))
///     .build();
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) and can be safely transferred between
/// threads, but it is not thread-safe ([`Sync`]) as it contains mutable
/// configuration state.
#[derive(Debug)]
#[must_use]
pub struct BlockPoolBuilder {
    min_block_size: NonZero<usize>,
    max_block_size: NonZero<usize>,
    keep_alive: Duration,
    sweep_interval: Duration,

    // Prevents Sync while allowing Send - builders are thread-mobile but not thread-safe
    _not_sync: PhantomData<Cell<()>>,
}

impl BlockPoolBuilder {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            min_block_size: DEFAULT_MIN_BLOCK_SIZE,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            keep_alive: DEFAULT_KEEP_ALIVE,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            _not_sync: PhantomData,
        }
    }

    /// Sets the smallest request size the pool will manage.
    ///
    /// Requests below this are passed directly to the system allocator.
    #[inline]
    pub fn min_block_size(mut self, size: NonZero<usize>) -> Self {
        self.min_block_size = size;
        self
    }

    /// Sets the largest request size the pool will manage.
    ///
    /// Requests above this are passed directly to the system allocator.
    #[inline]
    pub fn max_block_size(mut self, size: NonZero<usize>) -> Self {
        self.max_block_size = size;
        self
    }

    /// Sets how long a released block may remain idle in its free list before the
    /// reclamation sweep returns it to the system allocator.
    ///
    /// A zero duration makes every idle block eligible on the next sweep, which is
    /// mostly useful in tests.
    #[inline]
    pub fn keep_alive(mut self, duration: Duration) -> Self {
        self.keep_alive = duration;
        self
    }

    /// Sets the period of the background reclamation sweep.
    #[inline]
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Builds the pool with the specified configuration and starts its background
    /// reclamation thread.
    ///
    /// If the thread cannot be started the pool is still returned and remains
    /// usable; the condition is observable via
    /// [`reclamation_error()`](BlockPool::reclamation_error).
    ///
    /// # Panics
    ///
    /// Panics if `max_block_size` is smaller than `min_block_size` or if the sweep
    /// interval is zero.
    #[must_use]
    #[inline]
    pub fn build(self) -> BlockPool {
        assert!(
            self.sweep_interval > Duration::ZERO,
            "sweep interval must be non-zero"
        );

        BlockPool::new_inner(
            self.min_block_size,
            self.max_block_size,
            self.keep_alive,
            self.sweep_interval,
        )
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    // Test trait implementations.
    assert_impl_all!(BlockPoolBuilder: Send, std::fmt::Debug);
    assert_not_impl_any!(BlockPoolBuilder: Sync);

    #[test]
    fn new_starts_from_documented_defaults() {
        let builder = BlockPoolBuilder::new();

        assert_eq!(builder.min_block_size, DEFAULT_MIN_BLOCK_SIZE);
        assert_eq!(builder.max_block_size, DEFAULT_MAX_BLOCK_SIZE);
        assert_eq!(builder.keep_alive, DEFAULT_KEEP_ALIVE);
        assert_eq!(builder.sweep_interval, DEFAULT_SWEEP_INTERVAL);
    }

    #[test]
    fn settings_can_be_chained_and_overridden() {
        let builder = BlockPoolBuilder::new()
            .min_block_size(nz!(16))
            .max_block_size(nz!(4096))
            .keep_alive(Duration::from_secs(1))
            .sweep_interval(Duration::from_millis(100))
            .keep_alive(Duration::from_secs(2));

        assert_eq!(builder.min_block_size, nz!(16));
        assert_eq!(builder.max_block_size, nz!(4096));
        assert_eq!(builder.keep_alive, Duration::from_secs(2));
        assert_eq!(builder.sweep_interval, Duration::from_millis(100));
    }

    #[test]
    #[should_panic]
    fn zero_sweep_interval_panics() {
        drop(BlockPoolBuilder::new().sweep_interval(Duration::ZERO).build());
    }

    #[test]
    #[should_panic]
    fn max_below_min_panics() {
        drop(
            BlockPoolBuilder::new()
                .min_block_size(nz!(1024))
                .max_block_size(nz!(64))
                .build(),
        );
    }

    #[test]
    fn builder_is_send() {
        let builder = BlockPoolBuilder::new().min_block_size(nz!(32));
        let handle = std::thread::spawn(move || builder.build());
        drop(handle.join().expect("thread completed successfully"));
    }
}
