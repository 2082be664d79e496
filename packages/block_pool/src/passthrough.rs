use std::num::NonZero;
use std::ptr::NonNull;

use crate::block;

/// The two-operation allocation capability: acquire a block of N bytes, release a
/// previously acquired block.
///
/// Implemented by [`BlockPool`](crate::BlockPool) (the pooling allocator) and by
/// [`PassthroughAllocator`] (the no-op baseline), so call sites and benchmarks can
/// swap one for the other.
pub trait BlockAllocator {
    /// Acquires a block of at least `size` bytes and returns its address.
    ///
    /// On success the address is never null or dangling. Allocation failure in the
    /// underlying system allocator is surfaced as a panic.
    ///
    /// # Panics
    ///
    /// Panics if the system allocator cannot satisfy an underlying request.
    #[must_use]
    fn acquire(&self, size: NonZero<usize>) -> NonNull<u8>;

    /// Releases a block previously returned by [`acquire()`](Self::acquire).
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by a prior `acquire()` on this same allocator
    /// and must not have been released already. Double-release, or releasing an
    /// address obtained elsewhere, is undefined behavior - the same contract as the
    /// underlying system allocator.
    unsafe fn release(&self, ptr: NonNull<u8>);
}

/// A baseline allocator that forwards every request directly to the system
/// allocator.
///
/// No pooling, no hidden header, no background activity: each acquire is one
/// system allocation and each release one system free. It exists as the
/// conformance and performance comparator for [`BlockPool`](crate::BlockPool).
///
/// # Examples
///
/// ```
/// use block_pool::{BlockAllocator, PassthroughAllocator};
/// use new_zealand::nz;
///
/// let allocator = PassthroughAllocator;
///
/// let ptr = allocator.acquire(nz!(100));
///
/// // SAFETY: The pointer came from this allocator and is released exactly once.
/// unsafe { allocator.release(ptr) };
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughAllocator;

impl BlockAllocator for PassthroughAllocator {
    fn acquire(&self, size: NonZero<usize>) -> NonNull<u8> {
        block::system_acquire(size)
    }

    unsafe fn release(&self, ptr: NonNull<u8>) {
        // SAFETY: Forwarding the caller's guarantee that this is a live allocation
        // from this allocator, which hands out system allocations unchanged.
        unsafe {
            block::system_release(ptr);
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::fmt::Debug;

    use new_zealand::nz;
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(PassthroughAllocator: Send, Sync, Debug);

    #[test]
    fn acquire_release_round_trip() {
        let allocator = PassthroughAllocator;

        let ptr = allocator.acquire(nz!(100));

        unsafe {
            ptr.write_bytes(0x5A, 100);
            assert_eq!(ptr.read(), 0x5A);
        }

        unsafe { allocator.release(ptr) };
    }

    #[test]
    fn repeated_cycles_do_not_interfere() {
        let allocator = PassthroughAllocator;

        for _ in 0..100 {
            let ptr = allocator.acquire(nz!(64));
            unsafe { allocator.release(ptr) };
        }
    }
}
