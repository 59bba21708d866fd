// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Combinators over already-spawned [`Task`]s: [`when_any`]/[`when_all`] for
//! homogeneous collections, [`select2`]/[`select3`] for a fixed, mixed-type
//! arity, in the same spirit as `ember-callable`'s `Callable0..Callable3`
//! arity family.
//!
//! All three poll every child with the *same* `Context` on every call
//! (`futures::future::select_all`'s approach), and a child that is not the
//! one that resolved is [`detach`](Task::detach)ed rather than dropped, so
//! it keeps running to its own completion instead of being canceled out
//! from under it.

use crate::{AsyncError, Task, TaskContext};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Future returned by [`when_any`].
pub struct WhenAny<T> {
    ctx: TaskContext,
    tasks: Vec<Option<Task<T>>>,
}

/// Waits for whichever of `tasks` completes first, returning its index and
/// result. Every other task is [`detach`](Task::detach)ed and left running.
///
/// Resolves to [`AsyncError::InvalidState`] if `tasks` is empty.
#[must_use]
pub fn when_any<T: Send + 'static>(ctx: &TaskContext, tasks: Vec<Task<T>>) -> WhenAny<T> {
    WhenAny {
        ctx: ctx.clone(),
        tasks: tasks.into_iter().map(Some).collect(),
    }
}

impl<T: Send + 'static> Future for WhenAny<T> {
    type Output = Result<(usize, Result<T, AsyncError>), AsyncError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.tasks.iter().all(Option::is_none) {
            return Poll::Ready(Err(AsyncError::InvalidState(
                "when_any was given no tasks to wait on",
            )));
        }

        if this.ctx.is_cancellation_requested() {
            detach_all(&mut this.tasks);
            return Poll::Ready(Err(AsyncError::Canceled));
        }

        for index in 0..this.tasks.len() {
            let Some(task) = this.tasks[index].as_mut() else {
                continue;
            };
            if let Poll::Ready(result) = Pin::new(task).poll(cx) {
                this.tasks[index] = None;
                detach_all(&mut this.tasks);
                return Poll::Ready(Ok((index, result)));
            }
        }

        Poll::Pending
    }
}

/// Future returned by [`when_all`].
pub struct WhenAll<T> {
    ctx: TaskContext,
    tasks: Vec<Option<Task<T>>>,
    results: Vec<Option<T>>,
}

/// Waits for every task in `tasks` to complete, in any order, resolving to
/// their results in the original order. Short-circuits on the first task
/// that errors (due to fault or cancellation), detaching the rest.
#[must_use]
pub fn when_all<T: Send + 'static>(ctx: &TaskContext, tasks: Vec<Task<T>>) -> WhenAll<T> {
    let len = tasks.len();
    WhenAll {
        ctx: ctx.clone(),
        tasks: tasks.into_iter().map(Some).collect(),
        results: (0..len).map(|_| None).collect(),
    }
}

impl<T: Send + 'static> Future for WhenAll<T> {
    type Output = Result<Vec<T>, AsyncError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.ctx.is_cancellation_requested() {
            detach_all(&mut this.tasks);
            return Poll::Ready(Err(AsyncError::Canceled));
        }

        let mut all_ready = true;
        for index in 0..this.tasks.len() {
            if this.results[index].is_some() {
                continue;
            }
            let Some(task) = this.tasks[index].as_mut() else {
                continue;
            };
            match Pin::new(task).poll(cx) {
                Poll::Ready(Ok(value)) => {
                    this.results[index] = Some(value);
                    this.tasks[index] = None;
                }
                Poll::Ready(Err(err)) => {
                    detach_all(&mut this.tasks);
                    return Poll::Ready(Err(err));
                }
                Poll::Pending => all_ready = false,
            }
        }

        if all_ready {
            let values = this
                .results
                .iter_mut()
                .map(|slot| slot.take().expect("every task resolved before all_ready was set"))
                .collect();
            Poll::Ready(Ok(values))
        } else {
            Poll::Pending
        }
    }
}

fn detach_all<T: Send + 'static>(tasks: &mut [Option<Task<T>>]) {
    for slot in tasks {
        if let Some(task) = slot.take() {
            task.detach();
        }
    }
}

/// The outcome of [`select2`]: which task finished first, and its result.
pub enum Either2<A, B> {
    First(Result<A, AsyncError>),
    Second(Result<B, AsyncError>),
}

/// Future returned by [`select2`].
pub struct Select2<A, B> {
    ctx: TaskContext,
    first: Option<Task<A>>,
    second: Option<Task<B>>,
}

/// Waits for whichever of `first`/`second` completes first. The other is
/// detached and left running.
#[must_use]
pub fn select2<A: Send + 'static, B: Send + 'static>(
    ctx: &TaskContext,
    first: Task<A>,
    second: Task<B>,
) -> Select2<A, B> {
    Select2 {
        ctx: ctx.clone(),
        first: Some(first),
        second: Some(second),
    }
}

impl<A: Send + 'static, B: Send + 'static> Future for Select2<A, B> {
    type Output = Result<Either2<A, B>, AsyncError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.ctx.is_cancellation_requested() {
            if let Some(task) = this.first.take() {
                task.detach();
            }
            if let Some(task) = this.second.take() {
                task.detach();
            }
            return Poll::Ready(Err(AsyncError::Canceled));
        }

        if let Some(task) = this.first.as_mut() {
            if let Poll::Ready(result) = Pin::new(task).poll(cx) {
                this.first = None;
                if let Some(task) = this.second.take() {
                    task.detach();
                }
                return Poll::Ready(Ok(Either2::First(result)));
            }
        }

        if let Some(task) = this.second.as_mut() {
            if let Poll::Ready(result) = Pin::new(task).poll(cx) {
                this.second = None;
                if let Some(task) = this.first.take() {
                    task.detach();
                }
                return Poll::Ready(Ok(Either2::Second(result)));
            }
        }

        Poll::Pending
    }
}

/// The outcome of [`select3`]: which task finished first, and its result.
pub enum Either3<A, B, C> {
    First(Result<A, AsyncError>),
    Second(Result<B, AsyncError>),
    Third(Result<C, AsyncError>),
}

/// Future returned by [`select3`].
pub struct Select3<A, B, C> {
    ctx: TaskContext,
    first: Option<Task<A>>,
    second: Option<Task<B>>,
    third: Option<Task<C>>,
}

/// Waits for whichever of `first`/`second`/`third` completes first. The
/// other two are detached and left running.
#[must_use]
pub fn select3<A: Send + 'static, B: Send + 'static, C: Send + 'static>(
    ctx: &TaskContext,
    first: Task<A>,
    second: Task<B>,
    third: Task<C>,
) -> Select3<A, B, C> {
    Select3 {
        ctx: ctx.clone(),
        first: Some(first),
        second: Some(second),
        third: Some(third),
    }
}

impl<A: Send + 'static, B: Send + 'static, C: Send + 'static> Future for Select3<A, B, C> {
    type Output = Result<Either3<A, B, C>, AsyncError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.ctx.is_cancellation_requested() {
            if let Some(task) = this.first.take() {
                task.detach();
            }
            if let Some(task) = this.second.take() {
                task.detach();
            }
            if let Some(task) = this.third.take() {
                task.detach();
            }
            return Poll::Ready(Err(AsyncError::Canceled));
        }

        if let Some(task) = this.first.as_mut() {
            if let Poll::Ready(result) = Pin::new(task).poll(cx) {
                this.first = None;
                if let Some(task) = this.second.take() {
                    task.detach();
                }
                if let Some(task) = this.third.take() {
                    task.detach();
                }
                return Poll::Ready(Ok(Either3::First(result)));
            }
        }

        if let Some(task) = this.second.as_mut() {
            if let Poll::Ready(result) = Pin::new(task).poll(cx) {
                this.second = None;
                if let Some(task) = this.first.take() {
                    task.detach();
                }
                if let Some(task) = this.third.take() {
                    task.detach();
                }
                return Poll::Ready(Ok(Either3::Second(result)));
            }
        }

        if let Some(task) = this.third.as_mut() {
            if let Poll::Ready(result) = Pin::new(task).poll(cx) {
                this.third = None;
                if let Some(task) = this.first.take() {
                    task.detach();
                }
                if let Some(task) = this.second.take() {
                    task.detach();
                }
                return Poll::Ready(Ok(Either3::Third(result)));
            }
        }

        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_thread_rt::{ThreadPoolConfig, ThreadPoolScheduler};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::task::{Wake, Waker};
    use std::time::Duration;

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
            std::thread::park_timeout(Duration::from_millis(10));
        }
    }

    #[test]
    fn when_any_resolves_to_the_first_finisher() {
        let scheduler = ThreadPoolScheduler::start(ThreadPoolConfig { workers: 4 });
        let (ctx, _root) = TaskContext::new(scheduler.handle().downgrade());

        let fast = Task::spawn(&ctx, async { 1 });
        let slow = Task::spawn(&ctx, async {
            std::thread::sleep(Duration::from_millis(200));
            2
        });

        let (index, result) = block_on(when_any(&ctx, vec![slow, fast])).unwrap();
        assert_eq!(index, 1);
        assert_eq!(result.unwrap(), 1);

        scheduler.shutdown();
    }

    #[test]
    fn when_all_collects_every_result_in_order() {
        let scheduler = ThreadPoolScheduler::start(ThreadPoolConfig { workers: 4 });
        let (ctx, _root) = TaskContext::new(scheduler.handle().downgrade());

        let tasks = vec![
            Task::spawn(&ctx, async { 1 }),
            Task::spawn(&ctx, async { 2 }),
            Task::spawn(&ctx, async { 3 }),
        ];

        let results = block_on(when_all(&ctx, tasks)).unwrap();
        assert_eq!(results, vec![1, 2, 3]);

        scheduler.shutdown();
    }

    #[test]
    fn select2_resolves_to_whichever_task_wins() {
        let scheduler = ThreadPoolScheduler::start(ThreadPoolConfig { workers: 4 });
        let (ctx, _root) = TaskContext::new(scheduler.handle().downgrade());

        let a = Task::spawn(&ctx, async {
            std::thread::sleep(Duration::from_millis(200));
            "a"
        });
        let b = Task::spawn(&ctx, async { 7i32 });

        match block_on(select2(&ctx, a, b)).unwrap() {
            Either2::Second(Ok(value)) => assert_eq!(value, 7),
            _ => panic!("expected the faster task (b) to win"),
        }

        scheduler.shutdown();
    }
}
