// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`AsyncGenerator<T>`]: a pull-based producer/consumer generator.
//!
//! Rust has no `co_yield`-style generator syntax, so the producer body is an
//! ordinary `async fn` taking a [`GeneratorContext<T>`] and the "yield a
//! value, suspend until it's consumed" step is a hand-written `Future`
//! ([`YieldValue`]) built the same way `ember_task::task`'s `Delay`/`YieldNow`
//! are: a small struct polled by the body's own driving task. The body runs
//! as an ordinary [`crate::Task`], so it keeps making progress independent
//! of whether [`AsyncGenerator::next`] is currently being polled.
//!
//! `next` takes `&mut self`, so the borrow checker rules out calling it
//! again before a previous call resolves — the same guarantee a runtime
//! assert would give, enforced one layer earlier.

use crate::{AsyncError, Task, TaskContext};
use ember_rc::Shared;
use ember_sync::SpinLock;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

enum Slot<T> {
    Empty,
    Value(T),
    Finished,
}

struct GenInner<T> {
    slot: SpinLock<Slot<T>>,
    producer_waker: SpinLock<Option<Waker>>,
    consumer_waker: SpinLock<Option<Waker>>,
}

impl<T> GenInner<T> {
    fn new() -> Self {
        Self {
            slot: SpinLock::new(Slot::Empty),
            producer_waker: SpinLock::new(None),
            consumer_waker: SpinLock::new(None),
        }
    }

    fn try_take(&self) -> Option<Poll<Result<Option<T>, AsyncError>>> {
        let mut slot = self.slot.lock();
        match &*slot {
            Slot::Value(_) => {
                let Slot::Value(value) = std::mem::replace(&mut *slot, Slot::Empty) else {
                    unreachable!()
                };
                drop(slot);
                if let Some(waker) = self.producer_waker.lock().take() {
                    waker.wake();
                }
                Some(Poll::Ready(Ok(Some(value))))
            }
            Slot::Finished => Some(Poll::Ready(Ok(None))),
            Slot::Empty => None,
        }
    }

    fn finish(&self) {
        *self.slot.lock() = Slot::Finished;
        if let Some(waker) = self.consumer_waker.lock().take() {
            waker.wake();
        }
    }
}

/// Handed to a generator body, used to yield successive values back to
/// whoever is calling [`AsyncGenerator::next`].
pub struct GeneratorContext<T> {
    inner: Shared<GenInner<T>>,
}

impl<T> Clone for GeneratorContext<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> GeneratorContext<T> {
    /// Yields `value` to the consumer, suspending the body until it has been
    /// taken by a [`AsyncGenerator::next`] call.
    pub fn yield_value(&self, value: T) -> YieldValue<'_, T> {
        YieldValue {
            inner: &self.inner,
            value: Some(value),
        }
    }
}

/// Future returned by [`GeneratorContext::yield_value`].
pub struct YieldValue<'a, T> {
    inner: &'a Shared<GenInner<T>>,
    value: Option<T>,
}

impl<T> Future for YieldValue<'_, T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();

        if let Some(value) = this.value.take() {
            *this.inner.slot.lock() = Slot::Value(value);
            if let Some(waker) = this.inner.consumer_waker.lock().take() {
                waker.wake();
            }
        }

        let slot = this.inner.slot.lock();
        if !matches!(&*slot, Slot::Value(_)) {
            return Poll::Ready(());
        }
        drop(slot);

        *this.inner.producer_waker.lock() = Some(cx.waker().clone());

        let slot = this.inner.slot.lock();
        if matches!(&*slot, Slot::Value(_)) {
            Poll::Pending
        } else {
            Poll::Ready(())
        }
    }
}

/// A pull generator: an asynchronous body that produces a stream of values
/// one at a time, backpressured so the body never runs ahead of its
/// consumer by more than one unconsumed value.
///
/// Not restartable: once the body returns (or faults, or is canceled),
/// every subsequent [`next`](Self::next) call returns `Ok(None)` or the
/// terminal error respectively.
pub struct AsyncGenerator<T> {
    inner: Shared<GenInner<T>>,
    driver: Task<()>,
}

impl<T: Send + 'static> AsyncGenerator<T> {
    /// Spawns `body` as the generator's driving task. `body` receives a
    /// [`GeneratorContext<T>`] it uses to yield values.
    pub fn new<F, Fut>(ctx: &TaskContext, body: F) -> Self
    where
        F: FnOnce(GeneratorContext<T>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let inner = Shared::new(GenInner::new());
        let gen_ctx = GeneratorContext {
            inner: inner.clone(),
        };
        let finish_on_return = inner.clone();
        let produced = body(gen_ctx);
        let driver = Task::spawn(ctx, async move {
            produced.await;
            finish_on_return.finish();
        });

        Self { inner, driver }
    }

    /// Produces the next value, or `Ok(None)` once the generator has
    /// finished. If the body panicked or was canceled before yielding
    /// again, that surfaces here as the corresponding [`AsyncError`].
    pub fn next(&mut self) -> Next<'_, T> {
        Next { generator: self }
    }
}

/// Future returned by [`AsyncGenerator::next`].
pub struct Next<'a, T> {
    generator: &'a mut AsyncGenerator<T>,
}

impl<T: Send + 'static> Future for Next<'_, T> {
    type Output = Result<Option<T>, AsyncError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(result) = this.generator.inner.try_take() {
            return result;
        }

        *this.generator.inner.consumer_waker.lock() = Some(cx.waker().clone());

        if let Some(result) = this.generator.inner.try_take() {
            return result;
        }

        // The body may have ended without ever calling `GenInner::finish`
        // (a panic unwinds past that call, cancellation short-circuits the
        // poll loop before it) — poll the driving task directly so that
        // case surfaces here instead of leaving `next` pending forever.
        match Pin::new(&mut this.generator.driver).poll(cx) {
            Poll::Ready(result) => {
                this.generator.inner.finish();
                match result {
                    Ok(()) => Poll::Ready(Ok(None)),
                    Err(err) => Poll::Ready(Err(err)),
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_thread_rt::{ThreadPoolConfig, ThreadPoolScheduler};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::task::Wake;

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
            std::thread::park_timeout(std::time::Duration::from_millis(10));
        }
    }

    #[test]
    fn yields_values_in_order_then_ends() {
        let scheduler = ThreadPoolScheduler::start(ThreadPoolConfig { workers: 2 });
        let (ctx, _root) = TaskContext::new(scheduler.handle().downgrade());

        let mut generator = AsyncGenerator::new(&ctx, |gen_ctx: GeneratorContext<i32>| async move {
            for value in 1..=3 {
                gen_ctx.yield_value(value).await;
            }
        });

        for expected in 1..=3 {
            assert_eq!(block_on(generator.next()).unwrap(), Some(expected));
        }
        assert_eq!(block_on(generator.next()).unwrap(), None);
        assert_eq!(block_on(generator.next()).unwrap(), None);

        scheduler.shutdown();
    }

    #[test]
    fn panicking_body_surfaces_as_fault_from_next() {
        let scheduler = ThreadPoolScheduler::start(ThreadPoolConfig { workers: 1 });
        let (ctx, _root) = TaskContext::new(scheduler.handle().downgrade());

        let mut generator = AsyncGenerator::new(&ctx, |gen_ctx: GeneratorContext<i32>| async move {
            gen_ctx.yield_value(1).await;
            panic!("generator body failed");
        });

        assert_eq!(block_on(generator.next()).unwrap(), Some(1));
        assert!(matches!(
            block_on(generator.next()),
            Err(AsyncError::Fault(_))
        ));

        scheduler.shutdown();
    }
}
