// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-worker timer shards plus a shared overflow shard for scheduling
//! work at a future deadline.
//!
//! Timers are coarse-monotonic: an entry with a deadline at or before `now`
//! fires on the next dispatch pass. There is no ordering guarantee between
//! entries with equal deadlines.

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
        // Reversed so the BinaryHeap (a max-heap) pops the earliest deadline.
        other.deadline.cmp(&self.deadline)
    }
}

/// A single shard of the timer set: a binary heap guarded by a spinlock.
///
/// Per-worker shards are written only by their owning worker but may be
/// drained by any worker helping with dispatch; the shared overflow shard is
/// written by any thread that schedules work without a current worker
/// context (e.g. from outside the scheduler entirely).
#[derive(Default)]
pub(crate) struct TimerShard {
    heap: SpinLock<BinaryHeap<TimerEntry>>,
}

impl TimerShard {
    pub(crate) fn new() -> Self {
        Self {
            heap: SpinLock::new(BinaryHeap::new()),
        }
    }

    pub(crate) fn push(&self, deadline: Instant, work: WorkItem) {
        self.heap.lock().push(TimerEntry { deadline, work });
    }

    /// Moves every entry whose deadline has elapsed into `out`.
    pub(crate) fn drain_ripe(&self, now: Instant, out: &mut Vec<WorkItem>) {
        let mut heap = self.heap.lock();
        while matches!(heap.peek(), Some(entry) if entry.deadline <= now) {
            // Safety of unwrap: `matches!` above just confirmed `peek` is `Some`.
            out.push(heap.pop().unwrap().work);
        }
    }

    /// The deadline of the next ripe entry, if any.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.lock().peek().map(|entry| entry.deadline)
    }
}
