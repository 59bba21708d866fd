// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The pool of reusable fiber stacks a worker dispatches work onto.
//!
//! Each [`PooledFiber`] runs an infinite loop on its own stack: pull a thunk
//! out of its local slot, run it to completion, park. A thunk running deep
//! in the call stack can call [`yield_now`] to hand control back to the
//! worker's master context without unwinding; the thunk's Rust call stack
//! stays exactly where it was, since `Suspend::suspend` only swaps the stack
//! pointer.

use ember_fiber::{DefaultFiberStack, Fiber};
use std::cell::Cell;

type Thunk = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static CURRENT_SUSPEND: Cell<*const ()> = const { Cell::new(std::ptr::null()) };
}

/// Hands control back to the worker that dispatched the fiber currently
/// executing on this thread.
///
/// # Panics
///
/// Panics if called outside of a fiber dispatched by [`PooledFiber::run`].
pub fn yield_now() {
    let ptr = CURRENT_SUSPEND.with(Cell::get);
    assert!(
        !ptr.is_null(),
        "yield_now() called outside of a fiber-scheduler worker"
    );
    // Safety: `ptr` was installed by `PooledFiber::run` for the dynamic
    // extent of the thunk currently executing on this thread's active fiber,
    // and `yield_now` only ever runs on that same thread within that extent.
    let suspend = unsafe { &*ptr.cast::<ember_fiber::Suspend<(), ()>>() };
    suspend.suspend(());
}

struct Local {
    thunk: Cell<Option<Thunk>>,
    busy: Cell<bool>,
}

/// A single pooled, reusable fiber stack.
pub(crate) struct PooledFiber {
    fiber: Fiber<(), (), (), Local, DefaultFiberStack>,
}

impl PooledFiber {
    pub(crate) fn new(stack_size: usize) -> Self {
        let stack = DefaultFiberStack::new(stack_size).expect("failed to allocate fiber stack");
        let local = Local {
            thunk: Cell::new(None),
            busy: Cell::new(false),
        };
        let fiber = Fiber::with_stack_and_local(stack, local, |(), suspend, local: &Local| -> () {
            let suspend_ptr = std::ptr::from_ref(suspend).cast::<()>();
            loop {
                if let Some(thunk) = local.thunk.take() {
                    local.busy.set(true);
                    CURRENT_SUSPEND.with(|cell| cell.set(suspend_ptr));
                    thunk();
                    CURRENT_SUSPEND.with(|cell| cell.set(std::ptr::null()));
                    local.busy.set(false);
                }
                suspend.suspend(());
            }
        });
        Self { fiber }
    }

    /// Resumes this fiber with a fresh `thunk` to run.
    ///
    /// # Panics
    ///
    /// Panics (via the fiber's internal assert) if this fiber is currently
    /// [`PooledFiber::is_parked`]: callers must resume a parked fiber with
    /// [`PooledFiber::resume_parked`] instead, since it is still running an
    /// in-progress thunk.
    pub(crate) fn start(&mut self, thunk: Thunk) {
        debug_assert!(!self.is_parked(), "started a fiber that is mid-thunk");
        self.fiber.fiber_local().thunk.set(Some(thunk));
        self.fiber.resume(());
    }

    /// Resumes a fiber that previously called [`yield_now`] mid-thunk,
    /// continuing exactly where it left off.
    pub(crate) fn resume_parked(&mut self) {
        debug_assert!(self.is_parked(), "resume_parked called on a non-parked fiber");
        self.fiber.resume(());
    }

    /// `true` if this fiber suspended mid-thunk (via [`yield_now`]) rather
    /// than reaching the pool's own idle parking point.
    pub(crate) fn is_parked(&self) -> bool {
        self.fiber.fiber_local().busy.get()
    }
}

impl Drop for PooledFiber {
    fn drop(&mut self) {
        // The pooled fiber's body loops forever and never returns, so it can
        // never reach `done()` on its own; force it so `Fiber::drop`'s
        // invariant check passes. Safe here because the pool only drops
        // fibers that are idle (not mid-thunk) during scheduler teardown.
        unsafe {
            self.fiber.force_reset();
        }
    }
}
