// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The thread-pool scheduler: the same external contract as
//! `ember-fiber-rt`'s fiber scheduler (an [`ExecutorCapability`]), but with
//! no pooled fibers and no ABI-level context switch. Each worker resumes
//! work on its own stack, so coroutines scheduled here must not rely on a
//! stack-local identity surviving a suspension — there is no suspension to
//! survive; a resume handle either runs to completion or it doesn't belong
//! on this scheduler.

mod timer;

use crossbeam_deque::{Injector, Steal, Stealer, Worker as DequeWorker};
use ember_executor::{ControlMessage, ExecutorCapability, ExecutorHandle, WorkItem};
use ember_sync::AtomicCondition;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use timer::DelayQueue;

/// Tuning knobs for a [`ThreadPoolScheduler`].
#[derive(Debug, Clone, Copy)]
pub struct ThreadPoolConfig {
    /// Number of worker threads.
    pub workers: usize,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1),
        }
    }
}

struct Shared {
    injector: Injector<WorkItem>,
    stealers: Vec<Stealer<WorkItem>>,
    delay_queue: DelayQueue,
    ready_condition: AtomicCondition,
    stop: AtomicBool,
}

struct Capability(Arc<Shared>);

impl ExecutorCapability for Capability {
    fn execute(&self, work: WorkItem) {
        self.0.injector.push(work);
        self.0.ready_condition.notify_one();
    }

    fn schedule_at(&self, deadline: Instant, work: WorkItem) {
        self.0.delay_queue.push(deadline, work);
        self.0.ready_condition.notify_one();
    }
}

/// A running thread-pool scheduler.
pub struct ThreadPoolScheduler {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    handle: ExecutorHandle,
}

impl ThreadPoolScheduler {
    /// Starts a new scheduler with `config`.
    #[must_use]
    pub fn start(config: ThreadPoolConfig) -> Self {
        let mut deque_workers = Vec::with_capacity(config.workers);
        let mut stealers = Vec::with_capacity(config.workers);
        for _ in 0..config.workers {
            let w = DequeWorker::new_fifo();
            stealers.push(w.stealer());
            deque_workers.push(w);
        }

        let shared = Arc::new(Shared {
            injector: Injector::new(),
            stealers,
            delay_queue: DelayQueue::new(),
            ready_condition: AtomicCondition::new(),
            stop: AtomicBool::new(false),
        });

        let handle = ExecutorHandle::new(Capability(shared.clone()));

        let workers = deque_workers
            .into_iter()
            .enumerate()
            .map(|(id, local)| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("ember-thread-worker-{id}"))
                    .spawn(move || worker_loop(id, shared, local))
                    .expect("failed to spawn thread-pool worker")
            })
            .collect();

        Self {
            shared,
            workers,
            handle,
        }
    }

    /// An owning handle to this scheduler's executor capability.
    #[must_use]
    pub fn handle(&self) -> &ExecutorHandle {
        &self.handle
    }

    /// Requests an orderly shutdown and joins every worker thread.
    pub fn shutdown(mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.ready_condition.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for ThreadPoolScheduler {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.ready_condition.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(id: usize, shared: Arc<Shared>, local: DequeWorker<WorkItem>) {
    let _span = tracing::debug_span!("thread-pool worker main loop", worker = id).entered();

    loop {
        match next_ready(&local, &shared, id) {
            Some(WorkItem::Control(ControlMessage::Shutdown)) => {
                tracing::debug!(worker = id, "stop signal received, shutting down");
                break;
            }
            Some(WorkItem::Control(ControlMessage::Tick)) => continue,
            Some(WorkItem::Resume(handle)) => handle.resume(),
            Some(WorkItem::Callable(mut c)) => {
                let _ = c.call();
            }
            None => {
                let now = Instant::now();
                let mut ripe = Vec::new();
                tracing::trace!(worker = id, "turning timer...");
                shared.delay_queue.drain_ripe(now, &mut ripe);
                if !ripe.is_empty() {
                    for work in ripe {
                        local.push(work);
                    }
                    continue;
                }

                if shared.stop.load(Ordering::Acquire) && local.is_empty() {
                    break;
                }

                let generation = shared.ready_condition.generation();
                let deadline = shared.delay_queue.next_deadline();
                tracing::trace!(worker = id, ?deadline, "going to sleep");
                match deadline {
                    Some(d) if d > now => {
                        shared.ready_condition.wait_if_for(generation, d - now);
                    }
                    Some(_) => {}
                    None => {
                        shared
                            .ready_condition
                            .wait_if_for(generation, Duration::from_millis(50));
                    }
                }
                tracing::trace!(worker = id, "woke up");
            }
        }
    }
}

const STEAL_ROUNDS: usize = 8;

fn next_ready(local: &DequeWorker<WorkItem>, shared: &Shared, id: usize) -> Option<WorkItem> {
    if let Some(item) = local.pop() {
        return Some(item);
    }
    loop {
        match shared.injector.steal_batch_and_pop(local) {
            Steal::Success(item) => return Some(item),
            Steal::Retry => continue,
            Steal::Empty => break,
        }
    }
    for round in 0..STEAL_ROUNDS {
        let mut made_progress = false;
        for (other_id, stealer) in shared.stealers.iter().enumerate() {
            if other_id == id {
                continue;
            }
            match stealer.steal() {
                Steal::Success(item) => {
                    tracing::trace!(worker = id, from = other_id, "stole work item");
                    return Some(item);
                }
                Steal::Retry => made_progress = true,
                Steal::Empty => {}
            }
        }
        if !made_progress && round > 0 {
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_callable::Callable;
    use std::sync::mpsc;

    #[test]
    fn runs_a_callable_work_item() {
        let scheduler = ThreadPoolScheduler::start(ThreadPoolConfig { workers: 2 });
        let (tx, rx) = mpsc::channel();
        let handle = scheduler.handle().downgrade();
        assert!(handle.execute(WorkItem::Callable(Callable::new(move || {
            tx.send(()).unwrap();
        }))));
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        scheduler.shutdown();
    }

    #[test]
    fn schedule_at_runs_no_earlier_than_deadline() {
        let scheduler = ThreadPoolScheduler::start(ThreadPoolConfig { workers: 1 });
        let (tx, rx) = mpsc::channel();
        let deadline = Instant::now() + Duration::from_millis(50);
        assert!(scheduler.handle().downgrade().schedule_at(
            deadline,
            WorkItem::Callable(Callable::new(move || {
                tx.send(Instant::now()).unwrap();
            })),
        ));
        let fired_at = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(fired_at >= deadline);
        scheduler.shutdown();
    }

    #[test]
    fn work_stealing_balances_across_workers() {
        let scheduler = ThreadPoolScheduler::start(ThreadPoolConfig { workers: 4 });
        let handle = scheduler.handle().downgrade();
        let (tx, rx) = mpsc::channel();
        for _ in 0..100 {
            let tx = tx.clone();
            handle.execute(WorkItem::Callable(Callable::new(move || {
                tx.send(()).unwrap();
            })));
        }
        for _ in 0..100 {
            rx.recv_timeout(Duration::from_secs(2)).unwrap();
        }
        scheduler.shutdown();
    }
}
