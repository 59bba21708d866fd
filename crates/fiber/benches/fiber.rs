// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::{criterion_group, criterion_main, Criterion};
use ember_fiber::{DefaultFiberStack, Fiber};

fn resume_roundtrip(c: &mut Criterion) {
    c.bench_function("fiber resume/suspend roundtrip", |b| {
        let mut fiber = Fiber::<i32, i32, i32>::with_stack(
            DefaultFiberStack::default(),
            |mut input, suspend, ()| loop {
                input = suspend.suspend(input);
            },
        );
        fiber.resume(0);
        b.iter(|| {
            fiber.resume(std::hint::black_box(1));
        });
    });
}

fn stack_allocation(c: &mut Criterion) {
    c.bench_function("fiber stack allocation", |b| {
        b.iter(DefaultFiberStack::default);
    });
}

criterion_group!(benches, resume_roundtrip, stack_allocation);
criterion_main!(benches);
