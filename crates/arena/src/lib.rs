// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Bump-pointer arena allocator and a tagged two-upstream fallback allocator.
//!
//! The arena never frees individual allocations; callers roll the whole
//! thing back to a [`Mark`] or [`Arena::reset`] it entirely. This mirrors the
//! frame-oriented bump allocators used for physical memory (`kmm`/`pmm`'s
//! `BumpAllocator`, which only ever grows an offset and treats individual
//! frees as unsupported), adapted here to byte-granular, alignment-aware
//! allocation for general-purpose engine scratch memory.

mod fallback;

pub use fallback::Fallback;

use ember_alloc::{AllocError, Allocator, BoundedCapacity, Owns};
use std::alloc::Layout;
use std::cell::Cell;
use std::ptr::NonNull;

/// An opaque position inside an [`Arena`], obtained from [`Arena::mark`] and
/// consumed by [`Arena::rollback`].
///
/// Rolling back to a mark taken on a *different* arena instance, or to a
/// mark whose arena has since been [`reset`](Arena::reset), is a contract
/// violation and panics in debug builds (checked via `generation`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mark {
    offset: usize,
    generation: u64,
}

#[cfg(feature = "counters")]
#[derive(Debug, Default)]
struct Counters {
    live: Cell<usize>,
    peak: Cell<usize>,
}

#[cfg(feature = "counters")]
impl Counters {
    fn on_alloc(&self, size: usize) {
        let live = self.live.get() + size;
        self.live.set(live);
        if live > self.peak.get() {
            self.peak.set(live);
        }
    }

    fn on_reset(&self) {
        self.live.set(0);
    }
}

/// A bump-pointer arena over a single contiguous block of memory.
///
/// `Arena` owns no upstream allocator: the backing block is supplied at
/// construction (either heap-allocated via [`Arena::new`] or caller-supplied
/// via [`Arena::from_raw_parts`]) and is never grown. Allocation requests
/// that do not fit the remaining capacity return `None`/[`AllocError`]
/// rather than falling back to another source — composing with a fallback
/// is the job of [`Fallback`].
pub struct Arena {
    base: NonNull<u8>,
    capacity: usize,
    offset: Cell<usize>,
    generation: Cell<u64>,
    owns_storage: bool,
    #[cfg(feature = "counters")]
    counters: Counters,
}

// SAFETY: `Arena` is only ever accessed through `&self` with interior
// mutability restricted to a single `Cell<usize>` offset; it carries no
// thread affinity of its own. It is not `Sync`, only `Send`, matching the
// single-writer-at-a-time scratch-allocator usage pattern.
unsafe impl Send for Arena {}

impl Arena {
    /// Allocates a new arena backed by `capacity` bytes of heap memory.
    pub fn new(capacity: usize) -> Self {
        let layout = Layout::from_size_align(capacity.max(1), 16)
            .expect("arena capacity overflows an allocation layout");
        // SAFETY: `layout` has non-zero size.
        let raw = unsafe { std::alloc::alloc(layout) };
        let base = NonNull::new(raw).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        Self {
            base,
            capacity,
            offset: Cell::new(0),
            generation: Cell::new(0),
            owns_storage: true,
            #[cfg(feature = "counters")]
            counters: Counters::default(),
        }
    }

    /// Builds an arena over caller-supplied storage. The arena does not take
    /// ownership of `storage` and will not free it on drop.
    ///
    /// # Safety
    ///
    /// `storage` must be valid for reads and writes for its full length for
    /// as long as the returned `Arena` (and any memory it hands out) is used.
    pub unsafe fn from_raw_parts(storage: NonNull<[u8]>) -> Self {
        Self {
            base: storage.cast(),
            capacity: storage.len(),
            offset: Cell::new(0),
            generation: Cell::new(0),
            owns_storage: false,
            #[cfg(feature = "counters")]
            counters: Counters::default(),
        }
    }

    /// Total capacity of the arena, in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently in use (i.e. the bump offset).
    #[must_use]
    pub fn used(&self) -> usize {
        self.offset.get()
    }

    /// Bytes remaining before the arena is exhausted, ignoring any
    /// additional padding the next allocation's alignment might require.
    #[must_use]
    pub fn available(&self) -> usize {
        self.capacity - self.offset.get()
    }

    /// Captures the current bump offset so allocations made after this call
    /// can later be released in bulk via [`rollback`](Arena::rollback).
    #[must_use]
    pub fn mark(&self) -> Mark {
        Mark {
            offset: self.offset.get(),
            generation: self.generation.get(),
        }
    }

    /// Releases every allocation made since `mark` was taken, moving the
    /// bump offset back. Does not run destructors for any values placed in
    /// the released region; callers are responsible for dropping anything
    /// they placed there before rolling back.
    ///
    /// # Panics
    ///
    /// Panics if `mark` was taken on a different arena instance or before
    /// the most recent [`reset`](Arena::reset), or if `mark.offset` exceeds
    /// the current offset (rolling forward is not supported).
    pub fn rollback(&self, mark: Mark) {
        assert_eq!(
            mark.generation,
            self.generation.get(),
            "rollback mark belongs to a different arena generation"
        );
        assert!(
            mark.offset <= self.offset.get(),
            "rollback mark is ahead of the current bump offset"
        );
        self.offset.set(mark.offset);
    }

    /// Releases every allocation made in the arena and bumps its generation,
    /// invalidating any outstanding [`Mark`]s.
    pub fn reset(&self) {
        self.offset.set(0);
        self.generation.set(self.generation.get().wrapping_add(1));
        #[cfg(feature = "counters")]
        self.counters.on_reset();
    }

    /// Peak bytes live since the last [`reset`](Arena::reset), only tracked
    /// when the `counters` feature is enabled.
    #[cfg(feature = "counters")]
    #[must_use]
    pub fn peak_used(&self) -> usize {
        self.counters.peak.get()
    }

    fn try_bump(&self, layout: Layout) -> Option<NonNull<u8>> {
        let start = self.base.as_ptr() as usize;
        let cur = start.checked_add(self.offset.get())?;
        let aligned = cur.checked_add(layout.align() - 1)? & !(layout.align() - 1);
        let padding = aligned.checked_sub(cur)?;
        let new_offset = self
            .offset
            .get()
            .checked_add(padding)?
            .checked_add(layout.size())?;
        if new_offset > self.capacity {
            return None;
        }
        self.offset.set(new_offset);
        #[cfg(feature = "counters")]
        self.counters.on_alloc(padding + layout.size());
        // SAFETY: `aligned` is within `[base, base + capacity)` since
        // `new_offset <= self.capacity` was just checked.
        Some(unsafe { NonNull::new_unchecked(aligned as *mut u8) })
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if self.owns_storage {
            let layout = Layout::from_size_align(self.capacity.max(1), 16).unwrap();
            // SAFETY: `base` was allocated with this exact layout in `new`.
            unsafe { std::alloc::dealloc(self.base.as_ptr(), layout) };
        }
    }
}

unsafe impl Allocator for Arena {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let ptr = self.try_bump(layout).ok_or(AllocError)?;
        Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
    }

    unsafe fn deallocate(&self, _ptr: NonNull<u8>, _layout: Layout) {
        // Arenas only release memory via `rollback`/`reset`; an individual
        // deallocate is intentionally a silent no-op, matching the spec's
        // "arena individual-free is a no-op" contract.
    }
}

impl Owns for Arena {
    fn owns(&self, ptr: NonNull<u8>) -> bool {
        let start = self.base.as_ptr() as usize;
        let end = start + self.capacity;
        let addr = ptr.as_ptr() as usize;
        addr >= start && addr < end.max(start)
    }
}

impl BoundedCapacity for Arena {
    fn max_size(&self) -> usize {
        self.capacity
    }

    fn remaining(&self) -> usize {
        self.available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_within_capacity() {
        let arena = Arena::new(1024);
        let layout = Layout::from_size_align(64, 8).unwrap();
        let a = arena.allocate(layout).unwrap();
        let b = arena.allocate(layout).unwrap();
        assert_ne!(a.as_non_null_ptr().as_ptr(), b.as_non_null_ptr().as_ptr());
        assert_eq!(arena.used(), 128);
    }

    #[test]
    fn exhaustion_returns_err() {
        let arena = Arena::new(16);
        let layout = Layout::from_size_align(32, 8).unwrap();
        assert!(arena.allocate(layout).is_err());
    }

    #[test]
    fn mark_and_rollback_reclaims_offset() {
        let arena = Arena::new(1024);
        let layout = Layout::from_size_align(64, 8).unwrap();
        let mark = arena.mark();
        arena.allocate(layout).unwrap();
        arena.allocate(layout).unwrap();
        assert_eq!(arena.used(), 128);
        arena.rollback(mark);
        assert_eq!(arena.used(), 0);
    }

    #[test]
    #[should_panic(expected = "different arena generation")]
    fn rollback_after_reset_panics() {
        let arena = Arena::new(1024);
        let mark = arena.mark();
        arena.reset();
        arena.rollback(mark);
    }

    #[test]
    fn reset_clears_usage() {
        let arena = Arena::new(1024);
        let layout = Layout::from_size_align(64, 8).unwrap();
        arena.allocate(layout).unwrap();
        arena.reset();
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn owns_reports_membership() {
        let arena = Arena::new(128);
        let layout = Layout::from_size_align(16, 8).unwrap();
        let ptr = arena.allocate(layout).unwrap();
        assert!(arena.owns(NonNull::new(ptr.as_ptr().cast::<u8>()).unwrap()));
        let other = Arena::new(16);
        let other_ptr = other.allocate(Layout::from_size_align(8, 8).unwrap()).unwrap();
        assert!(!arena.owns(NonNull::new(other_ptr.as_ptr().cast::<u8>()).unwrap()));
    }

    trait NonNullSliceExt<T> {
        fn as_non_null_ptr(&self) -> NonNull<T>;
    }

    impl<T> NonNullSliceExt<T> for NonNull<[T]> {
        fn as_non_null_ptr(&self) -> NonNull<T> {
            unsafe { NonNull::new_unchecked(self.as_ptr().cast::<T>()) }
        }
    }

    proptest::proptest! {
        #[test]
        fn bump_offset_never_exceeds_capacity(sizes in proptest::collection::vec(1usize..=200, 0..50)) {
            let arena = Arena::new(4096);
            for size in sizes {
                let layout = Layout::from_size_align(size, 8).unwrap();
                let _ = arena.allocate(layout);
                proptest::prop_assert!(arena.used() <= arena.capacity());
            }
        }
    }
}
