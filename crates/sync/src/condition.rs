// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A generation-counter condition variable for blocking (thread-level)
//! waits, as opposed to `ember-task`'s `Waker`-based async combinators.
//!
//! The subscribe-before-check ordering below is the same race-avoidance
//! pattern `kasync::sync::wait_cell::WaitCell` uses: a waiter must be queued
//! *before* it re-checks the generation counter, otherwise a notification
//! sent between the check and the queueing would be missed entirely.

use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

/// A condition variable identified by a monotonically increasing
/// generation counter rather than a boolean predicate, letting callers
/// avoid missed-wakeup races by comparing a generation snapshot instead of
/// re-checking a condition under a lock.
pub struct AtomicCondition {
    generation: AtomicU32,
    waiters: SegQueue<Thread>,
}

impl Default for AtomicCondition {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomicCondition {
    /// Creates a new condition starting at generation `0`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            generation: AtomicU32::new(0),
            waiters: SegQueue::new(),
        }
    }

    /// The current generation. Snapshot this before checking whatever
    /// predicate this condition guards, then pass it to [`wait_if`](Self::wait_if)
    /// to block only if no notification happened in between.
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Blocks the current thread until the generation advances past
    /// `expected`.
    pub fn wait_if(&self, expected: u32) {
        self.queue_self();
        if self.generation.load(Ordering::Acquire) != expected {
            return;
        }
        loop {
            thread::park();
            if self.generation.load(Ordering::Acquire) != expected {
                return;
            }
        }
    }

    /// Like [`wait_if`](Self::wait_if), but gives up after `timeout` and
    /// returns `false` if the generation never advanced.
    pub fn wait_if_for(&self, expected: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.queue_self();
        loop {
            if self.generation.load(Ordering::Acquire) != expected {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::park_timeout(deadline - now);
        }
    }

    /// Unconditionally blocks until the next notification, regardless of
    /// the current generation. Equivalent to `wait_if(self.generation())`
    /// taken and checked atomically.
    pub fn wait(&self) {
        let expected = self.generation();
        self.wait_if(expected);
    }

    /// Wakes one waiting thread, if any, and advances the generation.
    pub fn notify_one(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(thread) = self.waiters.pop() {
            thread.unpark();
        }
    }

    /// Wakes all waiting threads and advances the generation.
    pub fn notify_all(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        while let Some(thread) = self.waiters.pop() {
            thread.unpark();
        }
    }

    fn queue_self(&self) {
        self.waiters.push(thread::current());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn notify_one_wakes_a_waiter() {
        let cond = Arc::new(AtomicCondition::new());
        let waiter = {
            let cond = cond.clone();
            thread::spawn(move || {
                let g = cond.generation();
                cond.wait_if(g);
            })
        };
        // Give the waiter a chance to queue itself before notifying.
        thread::sleep(Duration::from_millis(20));
        cond.notify_one();
        waiter.join().unwrap();
    }

    #[test]
    fn wait_if_for_times_out_without_notification() {
        let cond = AtomicCondition::new();
        let g = cond.generation();
        assert!(!cond.wait_if_for(g, Duration::from_millis(20)));
    }

    #[test]
    fn wait_if_returns_immediately_if_generation_already_advanced() {
        let cond = AtomicCondition::new();
        let g = cond.generation();
        cond.notify_all();
        cond.wait_if(g);
    }
}
