// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A capability-erased reference to whatever scheduler is backing execution:
//! the fiber scheduler, the thread-pool scheduler, or a test double.
//!
//! This plays the role `kasync::executor::Schedule` plays for task handles
//! (`current_task`/`spawn`/`wake`, implemented once for `&'static Executor<P>`
//! and used everywhere a task needs to talk back to its scheduler) but as a
//! *weak*, revocable handle: code that outlives the executor it was given
//! (a task continuation, a timer callback) can hold an `ExecutorRef` without
//! keeping the executor alive, and must check [`ExecutorRef::is_valid`] (or
//! simply observe a submission call returning `false`) rather than assume
//! the target is still there.

use ember_callable::Callable;
use ember_rc::{Shared, Ticket};
use std::time::Instant;

/// The capability a concrete scheduler exposes to the outside world.
///
/// Implemented once per scheduler backend (`ember-fiber-rt`, `ember-thread-rt`);
/// everything else in this workspace only ever talks to a scheduler through
/// an [`ExecutorHandle`]/[`ExecutorRef`] pair.
pub trait ExecutorCapability: Send + Sync {
    /// Submits `work` for execution as soon as a worker is free.
    fn execute(&self, work: WorkItem);

    /// Submits `work` to run no earlier than `deadline`.
    fn schedule_at(&self, deadline: Instant, work: WorkItem);
}

/// A unit of work submitted to an executor.
pub enum WorkItem {
    /// Resumes a previously suspended computation (a parked fiber, a woken
    /// task continuation).
    Resume(ResumeHandle),
    /// Runs an arbitrary zero-argument callable to completion on a worker.
    Callable(Callable),
    /// An out-of-band instruction to the scheduler itself, rather than a
    /// unit of user work.
    Control(ControlMessage),
}

/// An opaque handle to a suspended computation, constructed by the
/// scheduler that suspended it and submitted back to that same scheduler
/// (or an equivalent one) to resume.
pub struct ResumeHandle(Callable);

impl ResumeHandle {
    /// Wraps a zero-argument resume thunk.
    #[must_use]
    pub fn new(thunk: Callable) -> Self {
        Self(thunk)
    }

    /// Runs the resume thunk, consuming the handle.
    pub fn resume(mut self) {
        let _ = self.0.call();
    }
}

/// Control-plane instructions a scheduler accepts alongside user work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Requests an orderly shutdown: finish in-flight work, stop accepting
    /// new submissions.
    Shutdown,
    /// Requests an immediate timer-wheel tick, independent of its normal
    /// schedule (used by tests to make timer behavior deterministic).
    Tick,
}

/// The owning side of an executor capability. Scheduler backends construct
/// one of these and hand out [`ExecutorRef`]s via [`downgrade`](Self::downgrade).
pub struct ExecutorHandle {
    shared: Shared<Box<dyn ExecutorCapability>>,
}

impl ExecutorHandle {
    /// Wraps a concrete scheduler capability.
    pub fn new(capability: impl ExecutorCapability + 'static) -> Self {
        Self {
            shared: Shared::new(Box::new(capability)),
        }
    }

    /// Creates a weak, capability-erased reference to this executor.
    #[must_use]
    pub fn downgrade(&self) -> ExecutorRef {
        ExecutorRef {
            ticket: Shared::downgrade(&self.shared),
        }
    }

    /// Submits `work` directly, without going through a weak reference.
    pub fn execute(&self, work: WorkItem) {
        self.shared.execute(work);
    }

    /// Submits `work` to run at or after `deadline`, without going through a
    /// weak reference.
    pub fn schedule_at(&self, deadline: Instant, work: WorkItem) {
        self.shared.schedule_at(deadline, work);
    }
}

/// A capability-erased, weak reference to an executor.
///
/// Cloning an `ExecutorRef` is cheap (an atomic increment); every clone
/// observes the same underlying executor, if it is still alive.
#[derive(Clone)]
pub struct ExecutorRef {
    ticket: Ticket<Box<dyn ExecutorCapability>>,
}

impl ExecutorRef {
    /// Returns `true` if the referenced executor is still alive. This is
    /// inherently racy against concurrent shutdown: a `true` result can be
    /// stale by the time the caller acts on it, so callers should treat a
    /// failed [`execute`](Self::execute)/[`schedule_at`](Self::schedule_at)
    /// submission, not this check, as the authoritative outcome.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.ticket.lock().is_some()
    }

    /// Submits `work` for execution. Returns `false` without effect if the
    /// executor has already been torn down.
    #[must_use]
    pub fn execute(&self, work: WorkItem) -> bool {
        match self.ticket.lock() {
            Some(executor) => {
                executor.execute(work);
                true
            }
            None => false,
        }
    }

    /// Submits `work` to run at or after `deadline`. Returns `false` without
    /// effect if the executor has already been torn down.
    #[must_use]
    pub fn schedule_at(&self, deadline: Instant, work: WorkItem) -> bool {
        match self.ticket.lock() {
            Some(executor) => {
                executor.schedule_at(deadline, work);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting(Arc<AtomicUsize>);

    impl ExecutorCapability for Counting {
        fn execute(&self, work: WorkItem) {
            self.0.fetch_add(1, Ordering::SeqCst);
            if let WorkItem::Resume(handle) = work {
                handle.resume();
            }
        }

        fn schedule_at(&self, _deadline: Instant, _work: WorkItem) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn execute_through_weak_ref_reaches_executor() {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = ExecutorHandle::new(Counting(count.clone()));
        let reference = handle.downgrade();
        assert!(reference.is_valid());
        assert!(reference.execute(WorkItem::Control(ControlMessage::Tick)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ref_becomes_invalid_after_executor_drops() {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = ExecutorHandle::new(Counting(count.clone()));
        let reference = handle.downgrade();
        drop(handle);
        assert!(!reference.is_valid());
        assert!(!reference.execute(WorkItem::Control(ControlMessage::Tick)));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn resume_handle_runs_its_thunk() {
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        let handle = ResumeHandle::new(Callable::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));
        handle.resume();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
