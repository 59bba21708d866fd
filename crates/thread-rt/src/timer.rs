// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The delay queue: a binary heap of work items not yet ripe, guarded by a
//! spinlock. Same role as `ember-fiber-rt`'s timer shard, kept as a separate
//! (smaller) copy here since the thread-pool scheduler has no per-worker
//! shard split to make use of.

use ember_executor::WorkItem;
use ember_sync::SpinLock;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::time::Instant;

struct TimerEntry {
    deadline: Instant,
    work: WorkItem,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.deadline.cmp(&self.deadline)
    }
}

#[derive(Default)]
pub(crate) struct DelayQueue {
    heap: SpinLock<BinaryHeap<TimerEntry>>,
}

impl DelayQueue {
    pub(crate) fn new() -> Self {
        Self {
            heap: SpinLock::new(BinaryHeap::new()),
        }
    }

    pub(crate) fn push(&self, deadline: Instant, work: WorkItem) {
        self.heap.lock().push(TimerEntry { deadline, work });
    }

    pub(crate) fn drain_ripe(&self, now: Instant, out: &mut Vec<WorkItem>) {
        let mut heap = self.heap.lock();
        while matches!(heap.peek(), Some(entry) if entry.deadline <= now) {
            out.push(heap.pop().unwrap().work);
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.lock().peek().map(|entry| entry.deadline)
    }
}
