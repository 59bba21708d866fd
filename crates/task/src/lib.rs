// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The coroutine task layer: [`Task<T>`], [`AsyncGenerator<T>`], and the
//! `when_any`/`when_all`/`select2` combinators, all driven by an
//! [`ember_executor::ExecutorRef`] rather than a dedicated async runtime.
//!
//! Rust has no first-class coroutines matching the spec this layer is built
//! from, so `Task<T>` is a standard [`std::future::Future`] under the hood:
//! [`Task::spawn`] boxes the future, drives it with a [`std::task::Wake`]
//! that resubmits a poll to the executor on wake (mirroring
//! `kasync::task::Stage::poll`'s catch_unwind-guarded poll loop, generalized
//! from its hand-rolled `RawWakerVTable` to `std::task::Wake` since this
//! layer targets hosted `std` rather than `no_std`), and the returned
//! `Task<T>` is itself awaitable.

mod combinators;
mod generator;
mod task;

pub use combinators::{
    select2, select3, when_all, when_any, Either2, Either3, Select2, Select3, WhenAll, WhenAny,
};
pub use generator::{AsyncGenerator, GeneratorContext, Next, YieldValue};
pub use task::Task;

use ember_executor::ExecutorRef;
use ember_sync::{CancellationSource, CancellationToken, Registration};
use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// The bit-stable error taxonomy surfaced by every awaitable in this crate.
#[derive(Debug, thiserror::Error)]
pub enum AsyncError {
    /// The operation observed cancellation.
    #[error("operation was canceled")]
    Canceled,
    /// The producer failed internally; `Fault` carries the captured panic
    /// payload, matching `kasync::task::Stage::poll`'s `catch_unwind`-based
    /// panic capture.
    #[error("task panicked")]
    Fault(#[source] FaultPayload),
    /// A combinator or awaitable was used incorrectly (e.g. `when_any` with
    /// no children, or a generator polled concurrently).
    #[error("invalid use of an asynchronous primitive: {0}")]
    InvalidState(&'static str),
    /// A timed operation elapsed before completing.
    #[error("operation timed out")]
    Timeout,
}

/// A captured panic payload, boxed so [`AsyncError`] stays `Send` without
/// requiring the payload itself to implement `std::error::Error`.
pub struct FaultPayload(pub Box<dyn Any + Send + 'static>);

impl std::fmt::Debug for FaultPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FaultPayload(..)")
    }
}

impl std::fmt::Display for FaultPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("panic payload")
    }
}

impl std::error::Error for FaultPayload {}

/// The context a running task or generator body holds: an executor
/// reference, a cancellation token, and (implicitly) the linked-cancellation
/// chain installed by whoever spawned it.
#[derive(Clone)]
pub struct TaskContext {
    executor: ExecutorRef,
    cancellation: CancellationToken,
}

impl TaskContext {
    /// Builds a root context with its own, unlinked cancellation source.
    #[must_use]
    pub fn new(executor: ExecutorRef) -> (Self, CancellationSource) {
        let source = CancellationSource::new();
        let token = source.token();
        (
            Self {
                executor,
                cancellation: token,
            },
            source,
        )
    }

    /// Builds a context that shares `cancellation` directly (not linked —
    /// the same token, for nested bodies spawned under the same source).
    #[must_use]
    pub fn with_cancellation(executor: ExecutorRef, cancellation: CancellationToken) -> Self {
        Self {
            executor,
            cancellation,
        }
    }

    #[must_use]
    pub fn executor(&self) -> &ExecutorRef {
        &self.executor
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    #[must_use]
    pub fn is_cancellation_requested(&self) -> bool {
        self.cancellation.is_canceled()
    }

    /// Yields once to the executor, returning on the next dispatch pass.
    pub fn yield_now(&self) -> YieldNow {
        YieldNow {
            ctx: self.clone(),
            yielded: false,
        }
    }

    /// Suspends for at least `duration`, rounded up to the nearest
    /// nanosecond, waking early (with [`AsyncError::Canceled`]) if this
    /// context's cancellation fires first.
    pub fn delay(&self, duration: Duration) -> Delay {
        Delay {
            ctx: self.clone(),
            deadline: Instant::now() + duration,
            scheduled: false,
            cancellation: None,
        }
    }
}

/// Future returned by [`TaskContext::yield_now`].
pub struct YieldNow {
    ctx: TaskContext,
    yielded: bool,
}

impl Future for YieldNow {
    type Output = Result<(), AsyncError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.ctx.is_cancellation_requested() {
            return Poll::Ready(Err(AsyncError::Canceled));
        }
        if this.yielded {
            return Poll::Ready(Ok(()));
        }
        this.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// Future returned by [`TaskContext::delay`].
pub struct Delay {
    ctx: TaskContext,
    deadline: Instant,
    scheduled: bool,
    // Kept alive for as long as this `Delay` is pending so the early-wake
    // callback stays registered; dropping it (on completion, cancellation,
    // or the future itself being dropped) unregisters the callback instead
    // of leaving it in the source's callback vector forever.
    cancellation: Option<Registration>,
}

impl Future for Delay {
    type Output = Result<(), AsyncError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.ctx.is_cancellation_requested() {
            return Poll::Ready(Err(AsyncError::Canceled));
        }
        if Instant::now() >= this.deadline {
            return Poll::Ready(Ok(()));
        }
        if !this.scheduled {
            this.scheduled = true;
            tracing::trace!(deadline = ?this.deadline, "scheduling delay timer");
            let waker = cx.waker().clone();
            let _ = this.ctx.executor.schedule_at(
                this.deadline,
                ember_executor::WorkItem::Callable(ember_callable::Callable::new(move || {
                    waker.wake_by_ref();
                })),
            );
            let waker = cx.waker().clone();
            this.cancellation = Some(this.ctx.cancellation.register(ember_callable::Callable::new(
                move || {
                    waker.wake_by_ref();
                },
            )));
        }
        Poll::Pending
    }
}
