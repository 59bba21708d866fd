// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use ember_alloc::{Allocator, Global};
use std::alloc::Layout;
use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One allocation holding the atomic strong/weak counts, the payload, and the
/// allocator instance that produced the block, the same single-allocation
/// layout `TaskRef`'s `Header`-plus-task scheme uses for its type-erased
/// scheduler handles.
///
/// The weak count carries an implicit "self-weak" reference representing
/// "there is at least one live strong reference": it is initialized to `1`
/// and only decremented once the strong count reaches zero and the value has
/// been dropped. This is the same trick `std::sync::Arc` uses to avoid a
/// separate "is the value still alive" flag.
struct ControlBlock<T, A: Allocator> {
    strong: AtomicUsize,
    weak: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
    alloc: A,
}

/// A thread-safe, reference-counted handle to a heap-allocated `T`.
///
/// `Shared<T>` corresponds to `std::sync::Arc<T>`, but is allocator-
/// parametric and exposes an explicit [`Ticket<T>`] weak-reference type with
/// CAS-based promotion, matching the control-block design other components
/// of this workspace (task handles, executor references) are built from.
pub struct Shared<T, A: Allocator = Global> {
    ptr: NonNull<ControlBlock<T, A>>,
}

/// A non-owning, weak reference to a [`Shared`] value.
///
/// A `Ticket<T>` keeps the control block (but not necessarily the value)
/// alive. Use [`Ticket::lock`] to attempt to obtain a strong [`Shared<T>`],
/// which fails once the value has already been dropped.
pub struct Ticket<T, A: Allocator = Global> {
    ptr: NonNull<ControlBlock<T, A>>,
}

unsafe impl<T: Send + Sync, A: Allocator + Send + Sync> Send for Shared<T, A> {}
unsafe impl<T: Send + Sync, A: Allocator + Send + Sync> Sync for Shared<T, A> {}
unsafe impl<T: Send + Sync, A: Allocator + Send + Sync> Send for Ticket<T, A> {}
unsafe impl<T: Send + Sync, A: Allocator + Send + Sync> Sync for Ticket<T, A> {}

fn layout_for<T, A: Allocator>() -> Layout {
    Layout::new::<ControlBlock<T, A>>()
}

/// Deallocates a control block through the allocator instance stored inside
/// it, reading the allocator out first so the value isn't used after the
/// memory backing it is freed.
///
/// # Safety
///
/// `ptr` must point at a control block that is not referenced by any other
/// live `Shared`/`Ticket`, and whose `value` has already been dropped if it
/// was ever initialized.
unsafe fn dealloc_block<T, A: Allocator>(ptr: NonNull<ControlBlock<T, A>>) {
    let layout = layout_for::<T, A>();
    // SAFETY: caller guarantees exclusive access to the block; `alloc` is
    // read out by value before the memory holding it is freed.
    let alloc = unsafe { std::ptr::read(std::ptr::addr_of!((*ptr.as_ptr()).alloc)) };
    // SAFETY: `ptr` was produced by `alloc`'s own `allocate` call with this
    // exact layout in `Shared::new_in`.
    unsafe { alloc.deallocate(ptr.cast(), layout) };
}

impl<T> Shared<T, Global> {
    /// Allocates `value` on the global heap with a fresh control block.
    pub fn new(value: T) -> Self {
        Self::new_in(value, Global)
    }
}

impl<T, A: Allocator> Shared<T, A> {
    /// Allocates `value` using `alloc` with a fresh control block.
    ///
    /// `alloc` is retained for the lifetime of the block: both `Shared` and
    /// `Ticket` deallocate the control block through this exact allocator
    /// instance once the last weak reference drops, matching the contract
    /// that a block allocated via a given allocator is only ever freed
    /// through that same allocator.
    pub fn new_in(value: T, alloc: A) -> Self {
        let layout = layout_for::<T, A>();
        let raw = alloc
            .allocate(layout)
            .unwrap_or_else(|_| std::alloc::handle_alloc_error(layout));
        let ptr: NonNull<ControlBlock<T, A>> = raw.cast();
        // SAFETY: freshly allocated, uninitialized, correctly aligned.
        unsafe {
            ptr.as_ptr().write(ControlBlock {
                strong: AtomicUsize::new(1),
                weak: AtomicUsize::new(1),
                value: UnsafeCell::new(MaybeUninit::new(value)),
                alloc,
            });
        }
        Self { ptr }
    }

    fn block(&self) -> &ControlBlock<T, A> {
        // SAFETY: `self.ptr` is valid as long as `self` holds a strong count.
        unsafe { self.ptr.as_ref() }
    }

    /// The number of live `Shared` handles to this value.
    #[must_use]
    pub fn strong_count(&self) -> usize {
        self.block().strong.load(Ordering::Acquire)
    }

    /// The number of live `Ticket` handles to this value, including the
    /// implicit self-weak reference held while any `Shared` is alive.
    #[must_use]
    pub fn weak_count(&self) -> usize {
        self.block().weak.load(Ordering::Acquire).saturating_sub(1)
    }

    /// Creates a new weak [`Ticket`] to this value.
    #[must_use]
    pub fn downgrade(this: &Self) -> Ticket<T, A> {
        let block = this.block();
        let mut cur = block.weak.load(Ordering::Relaxed);
        loop {
            match block.weak.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ticket { ptr: this.ptr },
                Err(actual) => cur = actual,
            }
        }
    }

    /// Returns `true` if both handles point at the same allocation.
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.ptr == b.ptr
    }
}

impl<T, A: Allocator> std::ops::Deref for Shared<T, A> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: while any `Shared` is alive, the value is initialized and
        // will not be mutated or dropped by anyone else.
        unsafe { (*self.block().value.get()).assume_init_ref() }
    }
}

impl<T, A: Allocator> Clone for Shared<T, A> {
    fn clone(&self) -> Self {
        let prev = self.block().strong.fetch_add(1, Ordering::Relaxed);
        assert!(prev != 0, "cloned a Shared whose value has already been dropped");
        Self { ptr: self.ptr }
    }
}

impl<T, A: Allocator> Drop for Shared<T, A> {
    fn drop(&mut self) {
        if self.block().strong.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        std::sync::atomic::fence(Ordering::Acquire);
        // SAFETY: we just observed the last strong reference being dropped.
        unsafe {
            (*self.block().value.get()).assume_init_drop();
        }
        // Release the implicit self-weak reference now that the value is gone.
        if self.block().weak.fetch_sub(1, Ordering::Release) == 1 {
            std::sync::atomic::fence(Ordering::Acquire);
            // SAFETY: this was the last weak reference; no one else can
            // observe the control block after this point.
            unsafe { dealloc_block(self.ptr) };
        }
    }
}

impl<T: fmt::Debug, A: Allocator> fmt::Debug for Shared<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Shared").field(&**self).finish()
    }
}

impl<T, A: Allocator> Ticket<T, A> {
    fn block(&self) -> &ControlBlock<T, A> {
        // SAFETY: a `Ticket` keeps the control block allocation alive even
        // after the value itself has been dropped.
        unsafe { self.ptr.as_ref() }
    }

    /// Attempts to upgrade this weak reference into a strong [`Shared<T>`].
    ///
    /// Returns `None` if the value has already been dropped (i.e. the last
    /// `Shared` was dropped before this call).
    pub fn lock(&self) -> Option<Shared<T, A>> {
        let block = self.block();
        let mut cur = block.strong.load(Ordering::Relaxed);
        loop {
            if cur == 0 {
                return None;
            }
            match block.strong.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(Shared { ptr: self.ptr }),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Returns `true` if both handles point at the same allocation.
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.ptr == b.ptr
    }
}

impl<T, A: Allocator> Clone for Ticket<T, A> {
    fn clone(&self) -> Self {
        self.block().weak.fetch_add(1, Ordering::Relaxed);
        Self { ptr: self.ptr }
    }
}

impl<T, A: Allocator> Drop for Ticket<T, A> {
    fn drop(&mut self) {
        if self.block().weak.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        std::sync::atomic::fence(Ordering::Acquire);
        // SAFETY: this was the last weak reference and the value (if any)
        // was already dropped by `Shared`'s destructor before this could
        // ever be reached (that drop is ordered-before via the fetch_sub
        // release/acquire pair on `weak`).
        unsafe { dealloc_block(self.ptr) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_increments_strong_count() {
        let a = Shared::new(1i32);
        let b = a.clone();
        assert_eq!(a.strong_count(), 2);
        drop(b);
        assert_eq!(a.strong_count(), 1);
    }

    #[test]
    fn ticket_lock_succeeds_while_strong_alive() {
        let a = Shared::new(1i32);
        let t = Shared::downgrade(&a);
        let locked = t.lock().expect("should upgrade");
        assert_eq!(*locked, 1);
    }

    #[test]
    fn ticket_lock_fails_after_value_dropped() {
        let a = Shared::new(1i32);
        let t = Shared::downgrade(&a);
        drop(a);
        assert!(t.lock().is_none());
    }

    #[test]
    fn value_drops_when_last_strong_drops() {
        use std::rc::Rc;
        let counter = Rc::new(std::cell::Cell::new(0));
        struct Dropper(Rc<std::cell::Cell<i32>>);
        impl Drop for Dropper {
            fn drop(&mut self) {
                self.0.set(self.0.get() + 1);
            }
        }
        let a = Shared::new(Dropper(counter.clone()));
        let t = Shared::downgrade(&a);
        drop(a);
        assert_eq!(counter.get(), 1);
        drop(t);
    }

    #[test]
    fn ptr_eq_detects_same_allocation() {
        let a = Shared::new(1i32);
        let b = a.clone();
        assert!(Shared::ptr_eq(&a, &b));
        let c = Shared::new(1i32);
        assert!(!Shared::ptr_eq(&a, &c));
    }

    #[test]
    fn new_in_deallocates_through_the_given_allocator() {
        use ember_alloc::Global;
        let a = Shared::new_in(7i32, Global);
        assert_eq!(*a, 7);
        let t = Shared::downgrade(&a);
        drop(a);
        drop(t);
    }
}
