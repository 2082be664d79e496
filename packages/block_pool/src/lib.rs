#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A size-classed recycling allocator that pools released memory blocks for fast reuse.
//!
//! This crate provides [`BlockPool`], a thread-safe pool that fronts the system allocator.
//! Requests within a configurable size range are rounded up to a size class boundary and
//! served from per-class free lists; releasing such a block parks it for reuse instead of
//! freeing it, so workloads that repeatedly allocate and free similar sizes mostly skip
//! the system allocator. A background thread returns blocks to the system once they have
//! sat idle past a keep-alive window, so a burst of activity does not pin its peak memory
//! footprint forever.
//!
//! # Key Features
//!
//! - **O(1) release without a size argument**: Every returned pointer carries a hidden
//!   header identifying its origin, so [`release()`](BlockPool::release) needs only the
//!   pointer
//! - **Size classes**: Two boundaries per power-of-two doubling keep rounding waste low
//! - **Transparent passthrough**: Requests outside the managed range go straight to the
//!   system allocator through the same API
//! - **Idle reclamation**: A background sweep frees blocks idle longer than the keep-alive
//!   window, oldest first
//! - **Thread-safe**: Any number of threads may acquire and release concurrently
//! - **Observable**: [`stats()`](BlockPool::stats) reports reuse hits, cold allocations,
//!   passthrough traffic, and evictions
//!
//! # Examples
//!
//! ```rust
//! use block_pool::BlockPool;
//! use new_zealand::nz;
//!
//! let pool = BlockPool::builder().build();
//!
//! // Acquire a block of at least 100 bytes.
//! let ptr = pool.acquire(nz!(100));
//!
//! // The block is ordinary writable memory.
//! // SAFETY: Freshly acquired block of at least 100 bytes.
//! unsafe { ptr.write_bytes(0, 100) };
//!
//! // SAFETY: The pointer came from this pool and is released exactly once.
//! unsafe { pool.release(ptr) };
//!
//! // The next acquire in the same size class reuses the pooled block.
//! let again = pool.acquire(nz!(100));
//! assert_eq!(again, ptr);
//! assert_eq!(pool.stats().reuse_hits, 1);
//! # // SAFETY: Still a live pointer from this pool.
//! # unsafe { pool.release(again) };
//! ```
//!
//! # Choosing a configuration
//!
//! The defaults (64 bytes to 1 GiB managed range, 15 second keep-alive, 2 second sweep
//! interval) suit general-purpose use. [`BlockPoolBuilder`] adjusts all of them; a shorter
//! keep-alive trades reuse hits for a smaller idle footprint.

mod block;
mod builder;
mod error;
mod linked_slab;
mod passthrough;
mod pool;
mod size_class;
mod sweeper;

pub use builder::BlockPoolBuilder;
pub use error::Error;
pub use passthrough::{BlockAllocator, PassthroughAllocator};
pub use pool::{BlockPool, PoolStats};
