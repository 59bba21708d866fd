// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The allocator contract shared by every memory-providing type in this
//! workspace (arenas, fallback allocators, smart references).
//!
//! This mirrors the shape of nightly `core::alloc::Allocator`, but is a
//! crate-local trait: this workspace targets hosted `std` on stable, so it
//! cannot depend on the `allocator_api` feature the way the teacher's
//! in-tree `linked-list-allocator` does.

use std::alloc::Layout;
use std::fmt;
use std::ptr::NonNull;

/// Error returned when an allocation request cannot be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("memory allocation failed")
    }
}

impl std::error::Error for AllocError {}

/// A source and sink of raw memory.
///
/// Implementations must uphold:
/// - `allocate`/`allocate_zeroed` either return a block of exactly the
///   requested size (or larger, per `layout`) aligned to `layout.align()`,
///   or fail with [`AllocError`].
/// - `deallocate` is a no-op-free contract violation unless `ptr`/`layout`
///   are exactly the values (or a `grow`/`shrink` result of them) that a
///   prior `allocate` call on the *same* allocator instance returned. Passing
///   a pointer from a different allocator is undefined behavior, not a
///   recoverable error — callers that need to check provenance use [`Owns`].
pub unsafe trait Allocator {
    /// Attempts to allocate a block of memory satisfying `layout`.
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError>;

    /// Like [`allocate`](Allocator::allocate), but the returned memory is
    /// guaranteed to be zero-initialized.
    fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let ptr = self.allocate(layout)?;
        // SAFETY: `ptr` was just allocated by `self` and is valid for
        // `layout.size()` bytes.
        unsafe {
            ptr.as_non_null_ptr().as_ptr().write_bytes(0, layout.size());
        }
        Ok(ptr)
    }

    /// Deallocates the block of memory referenced by `ptr`, previously
    /// allocated via [`allocate`](Allocator::allocate) with the exact same
    /// `layout`, on the exact same allocator instance.
    ///
    /// # Safety
    ///
    /// See the trait-level contract.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);

    /// Grows a previously allocated block in place when possible, or
    /// allocates a new block and copies the old contents otherwise.
    ///
    /// # Safety
    ///
    /// `ptr`/`old_layout` must describe a block currently allocated via this
    /// allocator, and `new_layout.size() >= old_layout.size()`.
    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() >= old_layout.size());
        let new_ptr = self.allocate(new_layout)?;
        // SAFETY: both ranges are valid for `old_layout.size()` bytes and
        // non-overlapping (`new_ptr` is freshly allocated).
        unsafe {
            ptr.as_ptr()
                .copy_to_nonoverlapping(new_ptr.as_non_null_ptr().as_ptr(), old_layout.size());
            self.deallocate(ptr, old_layout);
        }
        Ok(new_ptr)
    }

    /// Shrinks a previously allocated block.
    ///
    /// # Safety
    ///
    /// `ptr`/`old_layout` must describe a block currently allocated via this
    /// allocator, and `new_layout.size() <= old_layout.size()`.
    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() <= old_layout.size());
        let new_ptr = self.allocate(new_layout)?;
        // SAFETY: `new_layout.size()` is <= `old_layout.size()`, so this
        // copies only bytes that were valid in the old block.
        unsafe {
            ptr.as_ptr()
                .copy_to_nonoverlapping(new_ptr.as_non_null_ptr().as_ptr(), new_layout.size());
            self.deallocate(ptr, old_layout);
        }
        Ok(new_ptr)
    }
}

/// Extension for allocators that can answer whether a given pointer was
/// produced by them, used by fallback allocators to route `deallocate`
/// calls to the correct upstream without a header.
pub trait Owns {
    /// Returns `true` if `ptr` was allocated by this allocator and has not
    /// yet been deallocated.
    fn owns(&self, ptr: NonNull<u8>) -> bool;
}

/// Extension for allocators with a fixed capacity, used by arenas to report
/// remaining headroom without probing with a trial allocation.
pub trait BoundedCapacity {
    /// The total capacity of this allocator, in bytes, if bounded.
    fn max_size(&self) -> usize;

    /// The number of bytes currently available to satisfy a request,
    /// ignoring alignment padding.
    fn remaining(&self) -> usize;
}

/// Propagation traits mirroring the `propagate_on_*`/`is_always_equal`
/// associated-type contract of C++ `std::allocator_traits`. A container
/// generic over `A: Allocator` consults these (via the marker trait, or a
/// plain associated constant) to decide whether a copy/move/swap should
/// carry the source's allocator along or keep its own.
pub trait AllocatorPropagation {
    /// Whether a copy-assignment should replace the target's allocator with
    /// the source's.
    const PROPAGATE_ON_COPY_ASSIGN: bool = false;
    /// Whether a move-assignment should replace the target's allocator with
    /// the source's.
    const PROPAGATE_ON_MOVE_ASSIGN: bool = false;
    /// Whether a swap should exchange allocators along with the swapped
    /// contents.
    const PROPAGATE_ON_SWAP: bool = false;
    /// Whether all instances of this allocator type compare equal, meaning
    /// a pointer allocated by one instance can always be deallocated by
    /// another. Stateless allocators (e.g. the global allocator) set this to
    /// `true`; arenas and other stateful allocators leave it `false`.
    const IS_ALWAYS_EQUAL: bool = false;
}

/// The process-wide heap, forwarding to `std::alloc::{alloc, dealloc}`.
///
/// This is the allocator used when no explicit allocator is threaded through
/// (the `_in`-suffixed constructors described in `ember-rc` are the
/// allocator-parametric counterpart).
#[derive(Debug, Default, Clone, Copy)]
pub struct Global;

unsafe impl Allocator for Global {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            return Ok(NonNull::slice_from_raw_parts(layout.dangling(), 0));
        }
        // SAFETY: `layout` has non-zero size.
        let raw = unsafe { std::alloc::alloc(layout) };
        let ptr = NonNull::new(raw).ok_or(AllocError)?;
        Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        // SAFETY: forwarded from the caller's contract.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

impl AllocatorPropagation for Global {
    const IS_ALWAYS_EQUAL: bool = true;
}

impl Owns for Global {
    fn owns(&self, _ptr: NonNull<u8>) -> bool {
        // The global heap owns everything it might be asked about; fallback
        // allocators treat `Global` as the catch-all upstream, never the
        // probed-first one.
        true
    }
}

trait NonNullSliceExt<T> {
    fn as_non_null_ptr(&self) -> NonNull<T>;
}

impl<T> NonNullSliceExt<T> for NonNull<[T]> {
    fn as_non_null_ptr(&self) -> NonNull<T> {
        // SAFETY: `self` is non-null, so its data pointer is too.
        unsafe { NonNull::new_unchecked(self.as_ptr().cast::<T>()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_allocates_and_deallocates() {
        let layout = Layout::from_size_align(64, 8).unwrap();
        let ptr = Global.allocate(layout).unwrap();
        let data = ptr.as_non_null_ptr();
        unsafe {
            data.as_ptr().write_bytes(0xAB, 64);
            Global.deallocate(data, layout);
        }
    }

    #[test]
    fn global_allocate_zeroed_is_zero() {
        let layout = Layout::from_size_align(32, 8).unwrap();
        let ptr = Global.allocate_zeroed(layout).unwrap();
        let data = ptr.as_non_null_ptr();
        unsafe {
            let slice = std::slice::from_raw_parts(data.as_ptr(), 32);
            assert!(slice.iter().all(|&b| b == 0));
            Global.deallocate(data, layout);
        }
    }

    #[test]
    fn global_zero_sized_allocation_is_dangling_but_valid() {
        let layout = Layout::from_size_align(0, 1).unwrap();
        let ptr = Global.allocate(layout).unwrap();
        assert_eq!(ptr.len(), 0);
    }

    #[test]
    fn global_is_always_equal() {
        assert!(Global::IS_ALWAYS_EQUAL);
    }
}
