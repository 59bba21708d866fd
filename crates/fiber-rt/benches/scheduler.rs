// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::{criterion_group, criterion_main, Criterion};
use ember_callable::Callable;
use ember_executor::WorkItem;
use ember_fiber_rt::{FiberScheduler, FiberSchedulerConfig};
use std::sync::mpsc;
use std::time::Duration;

fn execute_roundtrip(c: &mut Criterion) {
    let scheduler = FiberScheduler::start(FiberSchedulerConfig {
        workers: 4,
        fibers_per_worker: 4,
        stack_size: 64 * 1024,
    });
    let handle = scheduler.handle().downgrade();

    c.bench_function("fiber scheduler execute roundtrip", |b| {
        b.iter(|| {
            let (tx, rx) = mpsc::channel();
            handle.execute(WorkItem::Callable(Callable::new(move || {
                let _ = tx.send(());
            })));
            rx.recv_timeout(Duration::from_secs(1)).unwrap();
        });
    });

    scheduler.shutdown();
}

criterion_group!(benches, execute_roundtrip);
criterion_main!(benches);
