// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cancellation source/token/registration, the cooperative cancellation
//! mechanism threaded through the fiber/thread schedulers and `ember-task`'s
//! `TaskContext`.

use crate::spinlock::SpinLock;
use ember_callable::Callable;
use ember_rc::Shared;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

struct Inner {
    fired: AtomicBool,
    next_id: AtomicU64,
    callbacks: SpinLock<Vec<(u64, Callable)>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            callbacks: SpinLock::new(Vec::new()),
        }
    }
}

/// The owning half of a cancellation relationship. Dropping a `CancellationSource`
/// does not fire it; call [`fire`](Self::fire) explicitly.
pub struct CancellationSource {
    inner: Shared<Inner>,
}

/// A cloneable, non-owning handle used by cancellation-aware code to observe
/// and register interest in a cancellation.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Shared<Inner>,
}

/// A handle returned by [`CancellationToken::register`], used to deregister
/// a callback before it fires.
pub struct Registration {
    inner: Shared<Inner>,
    id: u64,
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationSource {
    /// Creates a new, unfired cancellation source.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Shared::new(Inner::new()),
        }
    }

    /// Returns a token observing this source.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            inner: self.inner.clone(),
        }
    }

    /// Returns `true` once [`fire`](Self::fire) has been called.
    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    /// Fires the cancellation: marks the source as fired and invokes every
    /// registered callback exactly once, in registration order. Idempotent;
    /// calling `fire` more than once only invokes callbacks the first time.
    pub fn fire(&self) {
        if self
            .inner
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let callbacks = std::mem::take(&mut *self.inner.callbacks.lock());
        tracing::debug!(count = callbacks.len(), "firing cancellation");
        for (_, mut callback) in callbacks {
            let _ = callback.call();
        }
    }
}

impl CancellationToken {
    /// Returns `true` if the associated source has fired.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    /// Registers `callback` to run when this token's source fires.
    ///
    /// If the source has already fired, `callback` runs synchronously
    /// before this call returns, and the returned [`Registration`] is
    /// already inert (its `unregister` is then a no-op).
    pub fn register(&self, mut callback: Callable) -> Registration {
        if self.inner.fired.load(Ordering::Acquire) {
            let _ = callback.call();
            return Registration {
                inner: self.inner.clone(),
                id: 0,
            };
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut callbacks = self.inner.callbacks.lock();
            // Re-check under the lock: `fire` drains under the same lock, so
            // if it already ran we must invoke synchronously instead of
            // silently losing this callback.
            if self.inner.fired.load(Ordering::Acquire) {
                drop(callbacks);
                let _ = callback.call();
                return Registration {
                    inner: self.inner.clone(),
                    id: 0,
                };
            }
            callbacks.push((id, callback));
        }
        Registration {
            inner: self.inner.clone(),
            id,
        }
    }
}

impl Registration {
    /// Removes the associated callback if the source has not fired yet.
    /// A no-op if the source already fired (the callback either already ran
    /// or was invoked synchronously at registration time).
    ///
    /// Equivalent to simply dropping the `Registration`; this named method
    /// exists for call sites where an explicit "I'm done with this" reads
    /// better than a bare `drop(reg)`.
    pub fn unregister(self) {}
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.id == 0 {
            return;
        }
        self.inner
            .callbacks
            .lock()
            .retain(|(id, _)| *id != self.id);
    }
}

/// Links `child` to `parent`: firing `parent` fires `child`. Returns the
/// [`Registration`] backing the link, which can be [`unregister`](Registration::unregister)-ed
/// to break the link early (e.g. when `child`'s own scope ends before
/// `parent` ever fires).
#[must_use]
pub fn link(parent: &CancellationToken, child: &CancellationSource) -> Registration {
    let child = child.inner.clone();
    parent.register(Callable::new(move || {
        CancellationSource { inner: child.clone() }.fire();
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as O};
    use std::sync::Arc;

    #[test]
    fn fire_invokes_registered_callbacks() {
        let source = CancellationSource::new();
        let token = source.token();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _reg = token.register(Callable::new(move || {
            c.fetch_add(1, O::SeqCst);
        }));
        assert!(!token.is_canceled());
        source.fire();
        assert!(token.is_canceled());
        assert_eq!(count.load(O::SeqCst), 1);
    }

    #[test]
    fn fire_is_idempotent() {
        let source = CancellationSource::new();
        let token = source.token();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _reg = token.register(Callable::new(move || {
            c.fetch_add(1, O::SeqCst);
        }));
        source.fire();
        source.fire();
        assert_eq!(count.load(O::SeqCst), 1);
    }

    #[test]
    fn unregister_prevents_callback() {
        let source = CancellationSource::new();
        let token = source.token();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let reg = token.register(Callable::new(move || {
            c.fetch_add(1, O::SeqCst);
        }));
        reg.unregister();
        source.fire();
        assert_eq!(count.load(O::SeqCst), 0);
    }

    #[test]
    fn register_after_fire_runs_synchronously() {
        let source = CancellationSource::new();
        let token = source.token();
        source.fire();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _reg = token.register(Callable::new(move || {
            c.fetch_add(1, O::SeqCst);
        }));
        assert_eq!(count.load(O::SeqCst), 1);
    }

    #[test]
    fn linked_cancellation_propagates() {
        let parent = CancellationSource::new();
        let child = CancellationSource::new();
        let _link = link(&parent.token(), &child);
        assert!(!child.is_fired());
        parent.fire();
        assert!(child.is_fired());
    }
}
