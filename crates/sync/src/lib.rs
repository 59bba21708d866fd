// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Low-level synchronization primitives shared by the schedulers: a
//! spinlock, a generation-counter condition variable, and cooperative
//! cancellation.

mod cancellation;
mod condition;
mod spinlock;

pub use cancellation::{link, CancellationSource, CancellationToken, Registration};
pub use condition::AtomicCondition;
pub use spinlock::{SpinLock, SpinLockGuard};
