// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::{criterion_group, criterion_main, Criterion};
use ember_task::{Task, TaskContext};
use ember_thread_rt::{ThreadPoolConfig, ThreadPoolScheduler};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
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

fn spawn_and_join(c: &mut Criterion) {
    let scheduler = ThreadPoolScheduler::start(ThreadPoolConfig { workers: 4 });
    let (ctx, _root) = TaskContext::new(scheduler.handle().downgrade());

    c.bench_function("task spawn and join", |b| {
        b.iter(|| {
            let task = Task::spawn(&ctx, async { 1 + 1 });
            block_on(task).unwrap()
        });
    });

    scheduler.shutdown();
}

fn ping_pong(c: &mut Criterion) {
    let scheduler = ThreadPoolScheduler::start(ThreadPoolConfig { workers: 4 });
    let (ctx, _root) = TaskContext::new(scheduler.handle().downgrade());

    c.bench_function("task ping pong (10 yields)", |b| {
        b.iter(|| {
            let inner_ctx = ctx.clone();
            let task = Task::spawn(&ctx, async move {
                for _ in 0..10 {
                    let _ = inner_ctx.yield_now().await;
                }
            });
            block_on(task).unwrap()
        });
    });

    scheduler.shutdown();
}

criterion_group!(benches, spawn_and_join, ping_pong);
criterion_main!(benches);
