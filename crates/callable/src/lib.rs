// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A type-erased, small-buffer-optimized callable, in the spirit of
//! `kasync::task::TaskRef`'s vtable-based type erasure: instead of storing a
//! `Box<dyn FnMut(..)>` behind a pointer indirection for every closure, the
//! closure is stored inline when it fits three machine words and only
//! spills to the heap when it doesn't, with a `&'static` vtable supplying
//! the three operations that must be type-erased (invoke, fallible copy,
//! drop).
//!
//! Unlike the C++ original this is modeled on, no dedicated "move" thunk is
//! part of the vtable: every Rust value (closures included) is trivially
//! relocatable by a bitwise copy, so ordinary Rust moves already do the
//! right thing for both the inline and heap-spilled representations.

mod storage;

use std::fmt;
use storage::Buf;

/// Raised when invoking a [`Callable`] that holds no target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadCall;

impl fmt::Display for BadCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("called an empty Callable")
    }
}

impl std::error::Error for BadCall {}

/// Raised by [`try_clone`](Callable0::try_clone) (and its arity siblings)
/// when the stored target does not implement `Clone`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotCopyable;

impl fmt::Display for NotCopyable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callable target does not support cloning")
    }
}

impl std::error::Error for NotCopyable {}

macro_rules! define_callable {
    ($name:ident, $vtable:ident, $trait_bound:ident $(, $arg:ident : $ty:ident)*) => {
        struct $vtable<$($ty,)* R> {
            invoke: unsafe fn(*mut u8, $($ty),*) -> R,
            copy: Option<unsafe fn(*const u8, &mut Buf) -> bool>,
            drop: unsafe fn(&Buf, bool),
        }

        /// A type-erased callable. See the module documentation for the
        /// small-buffer-optimization contract.
        pub struct $name<$($ty,)* R> {
            vtable: Option<&'static $vtable<$($ty,)* R>>,
            data: Buf,
            inline: bool,
        }

        // SAFETY: `$name` is `Send` exactly when the erased target is,
        // which callers establish by only constructing it from `Send`
        // closures (`new` requires `F: Send`).
        unsafe impl<$($ty,)* R> Send for $name<$($ty,)* R> {}

        impl<$($ty,)* R> $name<$($ty,)* R> {
            /// Builds an empty `Callable` that returns [`BadCall`] on invocation.
            #[must_use]
            pub fn empty() -> Self {
                Self {
                    vtable: None,
                    data: [std::mem::MaybeUninit::uninit(); storage::INLINE_SIZE],
                    inline: true,
                }
            }

            /// Wraps a closure matching this callable's signature.
            pub fn new<F>(f: F) -> Self
            where
                F: FnMut($($ty),*) -> R + Send + 'static,
            {
                unsafe fn invoke_fn<F, $($ty,)* R>(data: *mut u8, $($arg: $ty),*) -> R
                where
                    F: FnMut($($ty),*) -> R,
                {
                    // SAFETY: `data` points at a live `F` for the duration of
                    // this call, guaranteed by the vtable contract.
                    let f = unsafe { &mut *data.cast::<F>() };
                    f($($arg),*)
                }

                unsafe fn drop_fn<F>(buf: &Buf, inline: bool) {
                    // SAFETY: forwarded from the caller's contract.
                    unsafe { storage::drop_in_place::<F>(buf, inline) };
                }

                // One vtable instance per monomorphization, materialized as
                // an associated const rather than a heap allocation: `F`'s
                // impl of this locally-scoped trait gives each distinct `F`
                // its own `VTABLE`, and taking a reference to it is eligible
                // for `'static` promotion since the value has no drop glue.
                trait VTableSource<$($ty,)* R> {
                    const VTABLE: $vtable<$($ty,)* R>;
                }

                impl<F, $($ty,)* R> VTableSource<$($ty,)* R> for F
                where
                    F: FnMut($($ty),*) -> R + Send + 'static,
                {
                    const VTABLE: $vtable<$($ty,)* R> = $vtable {
                        invoke: invoke_fn::<F, $($ty,)* R>,
                        copy: None,
                        drop: drop_fn::<F>,
                    };
                }

                let mut data: Buf = [std::mem::MaybeUninit::uninit(); storage::INLINE_SIZE];
                let inline = storage::write_into(&mut data, f);
                Self {
                    vtable: Some(&<F as VTableSource<$($ty,)* R>>::VTABLE),
                    data,
                    inline,
                }
            }

            /// Wraps a closure matching this callable's signature, retaining
            /// the ability to [`try_clone`](Self::try_clone) it.
            pub fn new_cloneable<F>(f: F) -> Self
            where
                F: FnMut($($ty),*) -> R + Clone + Send + 'static,
            {
                unsafe fn invoke_fn<F, $($ty,)* R>(data: *mut u8, $($arg: $ty),*) -> R
                where
                    F: FnMut($($ty),*) -> R,
                {
                    // SAFETY: see `new`'s `invoke_fn`.
                    let f = unsafe { &mut *data.cast::<F>() };
                    f($($arg),*)
                }

                unsafe fn copy_fn<F: Clone + Send + 'static>(
                    src: *const u8,
                    out: &mut Buf,
                ) -> bool {
                    // SAFETY: `src` points at a live `F`.
                    let value = unsafe { (*src.cast::<F>()).clone() };
                    storage::write_into(out, value)
                }

                unsafe fn drop_fn<F>(buf: &Buf, inline: bool) {
                    // SAFETY: see `new`'s `drop_fn`.
                    unsafe { storage::drop_in_place::<F>(buf, inline) };
                }

                // See `new`'s `VTableSource`; this trait is scoped to this
                // function body so its `copy: Some(..)` shape doesn't
                // collide with `new`'s own local trait of the same name.
                trait VTableSource<$($ty,)* R> {
                    const VTABLE: $vtable<$($ty,)* R>;
                }

                impl<F, $($ty,)* R> VTableSource<$($ty,)* R> for F
                where
                    F: FnMut($($ty),*) -> R + Clone + Send + 'static,
                {
                    const VTABLE: $vtable<$($ty,)* R> = $vtable {
                        invoke: invoke_fn::<F, $($ty,)* R>,
                        copy: Some(copy_fn::<F>),
                        drop: drop_fn::<F>,
                    };
                }

                let mut data: Buf = [std::mem::MaybeUninit::uninit(); storage::INLINE_SIZE];
                let inline = storage::write_into(&mut data, f);
                Self {
                    vtable: Some(&<F as VTableSource<$($ty,)* R>>::VTABLE),
                    data,
                    inline,
                }
            }

            /// Returns `true` if this callable currently holds no target.
            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.vtable.is_none()
            }

            /// Invokes the stored target, or returns [`BadCall`] if empty.
            pub fn call(&mut self, $($arg: $ty),*) -> Result<R, BadCall> {
                match self.vtable {
                    Some(vt) => {
                        let ptr = if self.inline {
                            self.data.as_mut_ptr().cast::<u8>()
                        } else {
                            storage::data_ptr::<u8>(&self.data, false)
                        };
                        // SAFETY: `vt.invoke` expects the raw target pointer
                        // written by `new`/`new_cloneable`, which `ptr` is.
                        Ok(unsafe { (vt.invoke)(ptr, $($arg),*) })
                    }
                    None => Err(BadCall),
                }
            }

            /// Attempts to clone this callable. Fails with [`NotCopyable`]
            /// when the stored target was not constructed via
            /// [`new_cloneable`](Self::new_cloneable).
            pub fn try_clone(&self) -> Result<Self, NotCopyable> {
                match self.vtable {
                    None => Ok(Self::empty()),
                    Some(vt) => {
                        let copy = vt.copy.ok_or(NotCopyable)?;
                        let src = if self.inline {
                            self.data.as_ptr().cast::<u8>()
                        } else {
                            storage::data_ptr::<u8>(&self.data, false).cast_const()
                        };
                        let mut data: Buf = [std::mem::MaybeUninit::uninit(); storage::INLINE_SIZE];
                        // SAFETY: `src` is a live target matching `vt`'s `F`.
                        let inline = unsafe { copy(src, &mut data) };
                        Ok(Self {
                            vtable: Some(vt),
                            data,
                            inline,
                        })
                    }
                }
            }

            /// Swaps the targets of two callables in O(1) time.
            pub fn swap(&mut self, other: &mut Self) {
                std::mem::swap(self, other);
            }
        }

        impl<$($ty,)* R> Drop for $name<$($ty,)* R> {
            fn drop(&mut self) {
                if let Some(vt) = self.vtable {
                    // SAFETY: `self.data`/`self.inline` describe a live
                    // target written by a matching vtable's constructor.
                    unsafe { (vt.drop)(&self.data, self.inline) };
                }
            }
        }

        impl<$($ty,)* R> Default for $name<$($ty,)* R> {
            fn default() -> Self {
                Self::empty()
            }
        }

        impl<$($ty,)* R> fmt::Debug for $name<$($ty,)* R> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("empty", &self.is_empty())
                    .field("inline", &self.inline)
                    .finish()
            }
        }

        #[allow(dead_code)]
        fn $trait_bound() {}
    };
}

define_callable!(Callable0, VTable0, _assert_callable0);
define_callable!(Callable1, VTable1, _assert_callable1, a0: A0);
define_callable!(Callable2, VTable2, _assert_callable2, a0: A0, a1: A1);
define_callable!(Callable3, VTable3, _assert_callable3, a0: A0, a1: A1, a2: A2);

/// The common zero-argument callable used for work items and continuations
/// throughout the executor/fiber/task crates.
pub type Callable = Callable0<()>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invokes_inline_closure() {
        let mut c = Callable1::<i32, i32>::new(|x| x + 1);
        assert_eq!(c.call(41).unwrap(), 42);
    }

    #[test]
    fn empty_callable_errors() {
        let mut c = Callable0::<i32>::empty();
        assert_eq!(c.call(), Err(BadCall));
    }

    #[test]
    fn spills_to_heap_for_large_captures() {
        let big = [0u8; 256];
        let mut c = Callable0::<usize>::new(move || big.len());
        assert_eq!(c.call().unwrap(), 256);
    }

    #[test]
    fn try_clone_fails_without_cloneable_construction() {
        let c = Callable0::<i32>::new(|| 1);
        assert_eq!(c.try_clone().unwrap_err(), NotCopyable);
    }

    #[test]
    fn try_clone_succeeds_for_cloneable_target() {
        let c = Callable1::<i32, i32>::new_cloneable(|x| x * 2);
        let mut cloned = c.try_clone().unwrap();
        assert_eq!(cloned.call(21).unwrap(), 42);
    }

    #[test]
    fn swap_exchanges_targets() {
        let mut a = Callable0::<i32>::new(|| 1);
        let mut b = Callable0::<i32>::new(|| 2);
        a.swap(&mut b);
        assert_eq!(a.call().unwrap(), 2);
        assert_eq!(b.call().unwrap(), 1);
    }

    #[test]
    fn drop_runs_for_both_inline_and_heap() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        let count = Arc::new(AtomicUsize::new(0));
        struct Dropper(Arc<AtomicUsize>, [u8; 128]);
        impl Drop for Dropper {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let d = Dropper(count.clone(), [0; 128]);
        {
            let _c = Callable0::<()>::new(move || {
                let _ = &d;
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
