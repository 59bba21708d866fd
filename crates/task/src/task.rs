// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`Task<T>`]: a `Future` handle to a coroutine body spawned onto an
//! executor, driven independently of whether anyone polls the handle.
//!
//! The driving loop mirrors `kasync::task::Stage::poll`'s `catch_unwind`
//! guarded poll, but the wake mechanism is `std::task::Wake` over a plain
//! `std::sync::Arc` rather than `kasync`'s hand-rolled `RawWakerVTable` and
//! intrusive `Header`/`VTable` scheme: that scheme exists because `kasync`
//! targets `no_std`, a constraint this crate does not share.

use crate::{AsyncError, FaultPayload, TaskContext};
use ember_callable::Callable;
use ember_executor::WorkItem;
use ember_rc::Shared;
use ember_sync::{CancellationSource, Registration, SpinLock};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Wake, Waker};

enum Slot<T> {
    Pending,
    Ready(Result<T, AsyncError>),
    Taken,
}

struct Inner<T> {
    slot: SpinLock<Slot<T>>,
    joiner: SpinLock<Option<Waker>>,
    cancellation: CancellationSource,
}

struct Driver<T, Fut> {
    inner: Shared<Inner<T>>,
    executor: ember_executor::ExecutorRef,
    future: SpinLock<Option<Pin<Box<Fut>>>>,
    polling: AtomicBool,
    repoll: AtomicBool,
    // Held only for their `Drop` side effect: unregistering these callbacks
    // once the driver itself goes away, instead of leaking an entry into the
    // cancellation source's callback vector for the task's entire run.
    #[allow(dead_code)]
    link: Registration,
    #[allow(dead_code)]
    cancel_watch: Registration,
}

impl<T, Fut> Driver<T, Fut>
where
    T: Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    fn submit(self: &Arc<Self>) {
        let driver = self.clone();
        let submitted = self.executor.execute(WorkItem::Callable(Callable::new(move || {
            driver.poll_once();
        })));
        if !submitted {
            self.finish(Err(AsyncError::Canceled));
        }
    }

    /// Polls the underlying future once, looping internally if a wake
    /// arrives while this very call still holds the future (so a wake
    /// racing the end of a poll is never lost).
    fn poll_once(self: &Arc<Self>) {
        if self.polling.swap(true, Ordering::AcqRel) {
            self.repoll.store(true, Ordering::Release);
            return;
        }

        loop {
            self.repoll.store(false, Ordering::Release);

            let mut future = match self.future.lock().take() {
                Some(future) => future,
                None => {
                    self.polling.store(false, Ordering::Release);
                    return;
                }
            };

            if self.inner.cancellation.is_fired() {
                self.polling.store(false, Ordering::Release);
                self.finish(Err(AsyncError::Canceled));
                return;
            }

            let waker = Waker::from(self.clone());
            let mut cx = Context::from_waker(&waker);
            let _span = tracing::trace_span!("task poll").entered();
            let outcome = catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));

            match outcome {
                Ok(Poll::Ready(value)) => {
                    tracing::trace!("task finished");
                    self.polling.store(false, Ordering::Release);
                    self.finish(Ok(value));
                    return;
                }
                Ok(Poll::Pending) => {
                    tracing::trace!("task pending");
                    *self.future.lock() = Some(future);
                }
                Err(payload) => {
                    tracing::trace!("task panicked");
                    self.polling.store(false, Ordering::Release);
                    self.finish(Err(AsyncError::Fault(FaultPayload(payload))));
                    return;
                }
            }

            if !self.repoll.load(Ordering::Acquire) {
                self.polling.store(false, Ordering::Release);
                return;
            }
        }
    }

    fn finish(&self, result: Result<T, AsyncError>) {
        *self.inner.slot.lock() = Slot::Ready(result);
        if let Some(waker) = self.inner.joiner.lock().take() {
            waker.wake();
        }
    }
}

impl<T, Fut> Wake for Driver<T, Fut>
where
    T: Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    fn wake(self: Arc<Self>) {
        self.submit();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.submit();
    }
}

/// A handle to a spawned coroutine body, itself a `Future` yielding the
/// body's result or an [`AsyncError`] if it was canceled or panicked.
///
/// Dropping a `Task` without calling [`detach`](Self::detach) requests
/// cancellation, matching the default "owner controls lifetime" contract
/// most join-handle types use; call `detach` for fire-and-forget work.
pub struct Task<T> {
    inner: Shared<Inner<T>>,
    detached: bool,
}

impl<T: Send + 'static> Task<T> {
    /// Spawns `future` onto the executor reachable through `ctx`, returning
    /// a handle that completes when the future does (or is canceled, or
    /// panics). The first poll is submitted to the executor rather than run
    /// inline, so `spawn` never runs any of the body on the caller's stack.
    pub fn spawn<Fut>(ctx: &TaskContext, future: Fut) -> Self
    where
        Fut: Future<Output = T> + Send + 'static,
    {
        let inner = Shared::new(Inner {
            slot: SpinLock::new(Slot::Pending),
            joiner: SpinLock::new(None),
            cancellation: CancellationSource::new(),
        });

        // Propagate the spawning context's cancellation into this task's own
        // source, and wake the driver promptly when that happens rather than
        // waiting for the body's own next natural wake. `new_cyclic` gives us
        // a `Weak` to the driver before it exists, so the watch callback can
        // be registered (and stored on the driver itself, so it lives for
        // exactly as long as the driver does) in one step.
        let link = ember_sync::link(ctx.cancellation(), &inner.cancellation);
        let driver = Arc::new_cyclic(|weak_driver: &Weak<Driver<T, Fut>>| {
            let weak_driver = weak_driver.clone();
            let cancel_watch = inner.cancellation.token().register(Callable::new(move || {
                if let Some(driver) = weak_driver.upgrade() {
                    driver.submit();
                }
            }));
            Driver {
                inner: inner.clone(),
                executor: ctx.executor().clone(),
                future: SpinLock::new(Some(Box::pin(future))),
                polling: AtomicBool::new(false),
                repoll: AtomicBool::new(false),
                link,
                cancel_watch,
            }
        });

        driver.submit();

        Self {
            inner,
            detached: false,
        }
    }

    /// Requests cancellation of this task. The task observes this the next
    /// time it is polled or yields back to the executor; it does not stop
    /// mid-poll.
    pub fn cancel(&self) {
        self.inner.cancellation.fire();
    }

    /// Returns `true` once this task has produced a result (success, fault,
    /// or cancellation).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(&*self.inner.slot.lock(), Slot::Ready(_) | Slot::Taken)
    }

    /// Lets the task keep running after this handle is dropped, instead of
    /// requesting cancellation.
    pub fn detach(mut self) {
        self.detached = true;
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, AsyncError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let mut slot = this.inner.slot.lock();
        if let Some(result) = take_if_ready(&mut slot) {
            return Poll::Ready(result);
        }
        drop(slot);

        *this.inner.joiner.lock() = Some(cx.waker().clone());

        // Re-check after registering: `Driver::finish` may have run between
        // the check above and the waker registration just now.
        let mut slot = this.inner.slot.lock();
        match take_if_ready(&mut slot) {
            Some(result) => Poll::Ready(result),
            None => Poll::Pending,
        }
    }
}

fn take_if_ready<T>(slot: &mut Slot<T>) -> Option<Result<T, AsyncError>> {
    match slot {
        Slot::Ready(_) => {
            let Slot::Ready(result) = std::mem::replace(slot, Slot::Taken) else {
                unreachable!()
            };
            Some(result)
        }
        Slot::Taken => Some(Err(AsyncError::InvalidState(
            "task result was already taken by a previous poll",
        ))),
        Slot::Pending => None,
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if !self.detached {
            self.inner.cancellation.fire();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_executor::ExecutorHandle;
    use ember_thread_rt::{ThreadPoolConfig, ThreadPoolScheduler};
    use std::time::Duration;

    fn test_ctx(scheduler: &ThreadPoolScheduler) -> (TaskContext, CancellationSource) {
        TaskContext::new(scheduler.handle().downgrade())
    }

    #[test]
    fn spawn_returns_the_future_value() {
        let scheduler = ThreadPoolScheduler::start(ThreadPoolConfig { workers: 2 });
        let (ctx, _root) = test_ctx(&scheduler);
        let task = Task::spawn(&ctx, async { 41 + 1 });
        let result = block_on(task);
        assert_eq!(result.unwrap(), 42);
        scheduler.shutdown();
    }

    #[test]
    fn canceling_before_completion_yields_canceled_error() {
        let scheduler = ThreadPoolScheduler::start(ThreadPoolConfig { workers: 1 });
        let (ctx, _root) = test_ctx(&scheduler);
        let task = Task::spawn(&ctx, async {
            loop {
                std::thread::sleep(Duration::from_millis(5));
            }
            #[allow(unreachable_code)]
            0
        });
        task.cancel();
        // The body above never yields, so it can't observe cancellation;
        // this exercises that cancel() alone does not stop a running body,
        // only that it is recorded for the next cooperative check point.
        assert!(!task.is_finished());
        drop(task);
        scheduler.shutdown();
    }

    #[test]
    fn panicking_body_surfaces_as_fault() {
        let scheduler = ThreadPoolScheduler::start(ThreadPoolConfig { workers: 1 });
        let (ctx, _root) = test_ctx(&scheduler);
        let task = Task::spawn(&ctx, async {
            panic!("boom");
            #[allow(unreachable_code)]
            ()
        });
        let result = block_on(task);
        assert!(matches!(result, Err(AsyncError::Fault(_))));
        scheduler.shutdown();
    }

    struct Parker {
        thread: std::thread::Thread,
        woken: AtomicBool,
    }

    impl Wake for Parker {
        fn wake(self: Arc<Self>) {
            self.wake_by_ref();
        }

        fn wake_by_ref(self: &Arc<Self>) {
            self.woken.store(true, Ordering::Release);
            self.thread.unpark();
        }
    }

    /// A minimal single-future executor for tests: this crate intentionally
    /// has no runtime of its own, so tests park the calling thread rather
    /// than pull in an async runtime dependency just to drive assertions.
    fn block_on<F: Future>(future: F) -> F::Output {
        let parker = Arc::new(Parker {
            thread: std::thread::current(),
            woken: AtomicBool::new(true),
        });
        let waker = Waker::from(parker.clone());
        let mut cx = Context::from_waker(&waker);
        let mut future = Box::pin(future);
        loop {
            if parker.woken.swap(false, Ordering::AcqRel) {
                if let Poll::Ready(value) = future.as_mut().poll(&mut cx) {
                    return value;
                }
            }
            std::thread::park_timeout(Duration::from_millis(10));
        }
    }
}
