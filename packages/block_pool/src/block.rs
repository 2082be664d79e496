//! The hidden-header ABI shared by `acquire()` and `release()`.
//!
//! Every pointer handed to a caller is preceded by implementation-private bytes
//! that `release()` later reads to pick the release path in O(1):
//!
//! | Allocation kind | Bytes before the user pointer | Underlying size |
//! |---|---|---|
//! | Passthrough | 1 tag byte = 0 | requested + 1 |
//! | Pooled | pointer-sized block key, then 1 tag byte = 1 | boundary + 1 + pointer size |
//!
//! The system allocator is the platform `malloc`/`free` pair. `std::alloc` cannot
//! serve here because `dealloc` demands the layout of the original allocation and
//! the passthrough header deliberately stores nothing but the one tag byte.
//!
//! All pointer arithmetic against the header lives in this module. The invariant
//! carried by every function below: `user_ptr` was produced by one of the acquire
//! functions in this module and has not yet been passed to a release function.

use std::num::NonZero;
use std::ptr::NonNull;

use crate::linked_slab::NodeKey;

/// Tag byte of a passthrough allocation, served directly by the system allocator.
pub(crate) const TAG_PASSTHROUGH: u8 = 0;

/// Tag byte of a pooled allocation, owned by a block record in the pool registry.
pub(crate) const TAG_POOLED: u8 = 1;

/// Bytes between the start of a pooled allocation and its user pointer.
pub(crate) const POOLED_HEADER_BYTES: usize = size_of::<usize>() + 1;

/// Per-pooled-allocation metadata, kept in the pool's block registry for as long
/// as the underlying memory exists.
///
/// While a block is in flight (handed to a caller) the record sits detached in the
/// registry; while idle it is linked into its size class's free list. The record
/// and the memory it describes are destroyed together, by reclamation or by pool
/// teardown.
#[derive(Debug)]
pub(crate) struct BlockRecord {
    /// Index of the owning size class. Written once at creation.
    pub(crate) class_index: usize,

    /// When the block was last released, in whole seconds of pool uptime.
    /// Second resolution is all the keep-alive policy needs.
    pub(crate) released_at: u64,

    /// The pointer handed to callers; the hidden header precedes it.
    pub(crate) user_ptr: NonNull<u8>,
}

// SAFETY: The record is the sole owner of the allocation behind `user_ptr` for
// bookkeeping purposes; all access to the record is serialized by the pool's lock,
// and the caller-side bytes are never touched through the record.
unsafe impl Send for BlockRecord {}

// SAFETY: See above; shared references to the record only read plain fields.
unsafe impl Sync for BlockRecord {}

/// Allocates raw bytes from the system allocator.
///
/// # Panics
///
/// Panics if the system allocator cannot satisfy the request. Out of memory is not
/// a condition we try to recover from; no partial state exists when this fires.
#[must_use]
pub(crate) fn system_acquire(size: NonZero<usize>) -> NonNull<u8> {
    // SAFETY: FFI call with no preconditions beyond a nonzero size, which the
    // parameter type guarantees.
    let ptr = unsafe { libc::malloc(size.get()) };

    NonNull::new(ptr.cast::<u8>())
        .expect("out of memory: the system allocator could not satisfy the request")
}

/// Returns memory obtained from [`system_acquire()`] to the system allocator.
///
/// # Safety
///
/// `ptr` must have come from [`system_acquire()`] and must not have been released
/// before.
pub(crate) unsafe fn system_release(ptr: NonNull<u8>) {
    // SAFETY: The caller guarantees this is a live allocation from `malloc`.
    unsafe {
        libc::free(ptr.as_ptr().cast());
    }
}

/// Allocates a passthrough block: one zero tag byte, then `size` bytes of user data.
///
/// # Panics
///
/// Panics on system allocator failure or if `size` is within one byte of
/// `usize::MAX` (no real request gets anywhere near that).
#[must_use]
pub(crate) fn acquire_passthrough(size: NonZero<usize>) -> NonNull<u8> {
    let total = size
        .get()
        .checked_add(1)
        .and_then(NonZero::new)
        .expect("passthrough allocation size overflows when adding the tag byte");

    let base = system_acquire(total);

    // SAFETY: `base` points to at least `size + 1` writable bytes; offset 0 is in
    // bounds.
    unsafe {
        base.write(TAG_PASSTHROUGH);
    }

    // SAFETY: The user region starts one byte past the tag, still inside the
    // allocation.
    unsafe { base.add(1) }
}

/// Frees a passthrough block given its user pointer.
///
/// # Safety
///
/// `user_ptr` must have come from [`acquire_passthrough()`] on this process's
/// system allocator and must not have been released before.
pub(crate) unsafe fn release_passthrough(user_ptr: NonNull<u8>) {
    // SAFETY: The passthrough header is exactly one tag byte, so the allocation
    // base is one byte before the user pointer.
    let base = unsafe { user_ptr.sub(1) };

    // SAFETY: `base` is the pointer originally returned by `malloc`.
    unsafe {
        system_release(base);
    }
}

/// Allocates the backing memory of a pooled block: pointer-sized key field, tag
/// byte, then `boundary` bytes of user data. The key field is left uninitialized;
/// the pool writes it via [`write_block_key()`] once the block record exists.
///
/// # Panics
///
/// Panics on system allocator failure.
#[must_use]
pub(crate) fn allocate_pooled(boundary: usize) -> NonNull<u8> {
    let total = boundary
        .checked_add(POOLED_HEADER_BYTES)
        .and_then(NonZero::new)
        .expect("pooled allocation size overflows when adding the header");

    let base = system_acquire(total);

    // SAFETY: The tag byte lives immediately after the pointer-sized key field,
    // within the `POOLED_HEADER_BYTES` prefix of the allocation.
    unsafe {
        base.add(size_of::<usize>()).write(TAG_POOLED);
    }

    // SAFETY: The user region starts right after the header, still inside the
    // allocation.
    unsafe { base.add(POOLED_HEADER_BYTES) }
}

/// Stores the owning block's registry key in the hidden header.
///
/// # Safety
///
/// `user_ptr` must have come from [`allocate_pooled()`] and the memory must still
/// be live.
pub(crate) unsafe fn write_block_key(user_ptr: NonNull<u8>, key: NodeKey) {
    // SAFETY: The key field occupies the first pointer-sized bytes of the
    // allocation, `POOLED_HEADER_BYTES` before the user pointer. `malloc` returns
    // memory aligned for any fundamental type, so the field is properly aligned
    // for a usize.
    unsafe {
        user_ptr
            .sub(POOLED_HEADER_BYTES)
            .cast::<usize>()
            .write(key.as_usize());
    }
}

/// Reads the tag byte preceding a user pointer returned by this allocator.
///
/// # Safety
///
/// `user_ptr` must have been returned by an acquire in this module and not yet
/// released; only then does the byte before it truthfully carry a tag.
#[must_use]
pub(crate) unsafe fn read_tag(user_ptr: NonNull<u8>) -> u8 {
    // SAFETY: Both header layouts place the tag byte immediately before the user
    // pointer.
    unsafe { user_ptr.sub(1).read() }
}

/// Recovers the registry key of a pooled block from its hidden header.
///
/// # Safety
///
/// `user_ptr` must carry tag [`TAG_POOLED`], i.e. it must have come from
/// [`allocate_pooled()`] followed by [`write_block_key()`], with the memory still
/// live.
#[must_use]
pub(crate) unsafe fn read_block_key(user_ptr: NonNull<u8>) -> NodeKey {
    // SAFETY: Mirror of `write_block_key()`; same layout and alignment argument.
    let raw = unsafe { user_ptr.sub(POOLED_HEADER_BYTES).cast::<usize>().read() };

    NodeKey::from_usize(raw)
}

/// Returns a pooled block's backing memory to the system allocator.
///
/// # Safety
///
/// `user_ptr` must have come from [`allocate_pooled()`], the block must not be in
/// flight (no caller may still hold the pointer), and it must not have been freed
/// before.
pub(crate) unsafe fn free_pooled(user_ptr: NonNull<u8>) {
    // SAFETY: The allocation base sits `POOLED_HEADER_BYTES` before the user
    // pointer.
    let base = unsafe { user_ptr.sub(POOLED_HEADER_BYTES) };

    // SAFETY: `base` is the pointer originally returned by `malloc`.
    unsafe {
        system_release(base);
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
    use new_zealand::nz;

    use super::*;

    #[test]
    fn passthrough_header_is_one_zero_byte() {
        let user_ptr = acquire_passthrough(nz!(100));

        let tag = unsafe { read_tag(user_ptr) };
        assert_eq!(tag, TAG_PASSTHROUGH);

        unsafe { release_passthrough(user_ptr) };
    }

    #[test]
    fn passthrough_user_region_is_writable() {
        let user_ptr = acquire_passthrough(nz!(64));

        unsafe {
            user_ptr.write_bytes(0xAB, 64);
            assert_eq!(user_ptr.read(), 0xAB);
            assert_eq!(user_ptr.add(63).read(), 0xAB);

            // Writing the user region must not disturb the tag.
            assert_eq!(read_tag(user_ptr), TAG_PASSTHROUGH);
        }

        unsafe { release_passthrough(user_ptr) };
    }

    #[test]
    fn pooled_header_round_trips_key_and_tag() {
        let user_ptr = allocate_pooled(112);
        let key = NodeKey::from_usize(1234);

        unsafe {
            write_block_key(user_ptr, key);

            assert_eq!(read_tag(user_ptr), TAG_POOLED);
            assert_eq!(read_block_key(user_ptr), key);
        }

        unsafe { free_pooled(user_ptr) };
    }

    #[test]
    fn pooled_user_region_does_not_clobber_header() {
        let user_ptr = allocate_pooled(112);
        let key = NodeKey::from_usize(usize::MAX);

        unsafe {
            write_block_key(user_ptr, key);
            user_ptr.write_bytes(0xFF, 112);

            assert_eq!(read_tag(user_ptr), TAG_POOLED);
            assert_eq!(read_block_key(user_ptr), key);
        }

        unsafe { free_pooled(user_ptr) };
    }
}
