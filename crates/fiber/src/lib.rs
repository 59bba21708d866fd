// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Stackful fibers: cooperative, two-way context switches between a caller
//! and a function running on its own stack.
//!
//! A [`Fiber`] is resumed with an `Input` value and runs until it either
//! [`suspend`](Suspend::suspend)s with a `Yield` value, handing control back
//! to the resumer, or returns with its final `Return` value. Switching is
//! implemented with hand-written, architecture-specific assembly
//! ([`arch::x86_64`], [`arch::aarch64`]) rather than OS threads, so a resume
//! is a handful of register saves/restores, not a context switch through the
//! kernel scheduler.

use crate::stack::StackPointer;
use crate::utils::{decode_val, encode_val, EncodedValue};
use std::cell::Cell;
use std::marker::PhantomData;
use std::mem::{ManuallyDrop, MaybeUninit};

mod arch;
pub mod stack;
mod utils;

pub use crate::stack::{DefaultFiberStack, FiberStack, MIN_STACK_SIZE, STACK_ALIGNMENT};

/// The outcome of resuming a [`Fiber`]: either it suspended with a `Yield`
/// value, or it ran to completion and produced a `Return` value.
#[derive(Debug)]
pub enum FiberResult<Yield, Return> {
    Yield(Yield),
    Return(Return),
}

impl<Yield, Return> FiberResult<Yield, Return> {
    /// Unwraps the yielded value, panicking if the fiber had instead
    /// returned.
    pub fn into_yield(self) -> Option<Yield> {
        match self {
            Self::Yield(y) => Some(y),
            Self::Return(_) => None,
        }
    }

    /// Unwraps the returned value, panicking if the fiber had instead
    /// yielded.
    pub fn into_return(self) -> Option<Return> {
        match self {
            Self::Yield(_) => None,
            Self::Return(r) => Some(r),
        }
    }
}

/// A stackful, resumable computation running on its own stack.
///
/// `L` is a fiber-local value, constructed once up front and accessible from
/// within the fiber's body via [`Fiber::fiber_local`]; `S` is the stack
/// storage backing it (typically [`DefaultFiberStack`]).
pub struct Fiber<Input, Yield, Return, L = (), S: FiberStack = DefaultFiberStack> {
    stack: S,
    stack_ptr: Option<StackPointer>,
    initial_stack_ptr: StackPointer,
    fiber_local: *const L,
    marker: PhantomData<(fn(Input) -> Yield, fn() -> Return)>,
    // Fibers hold raw pointers into their own stack; they must never move
    // across threads.
    _not_send: PhantomData<*const ()>,
}

/// Handed to a fiber's body, used to suspend execution and hand a value back
/// to whoever resumed it.
#[repr(transparent)]
pub struct Suspend<Input, Yield> {
    stack_ptr: Cell<StackPointer>,
    marker: PhantomData<(fn(Yield) -> Input, *const ())>,
}

impl<Input, Yield> Suspend<Input, Yield> {
    /// Suspends the fiber, handing `val` back to the resumer, and returns
    /// the input passed to the next [`Fiber::resume`] call.
    pub fn suspend(&self, val: Yield) -> Input {
        let mut val = ManuallyDrop::new(val);
        // Safety: encode_val's contract is upheld by the fiber runtime, which
        // decodes exactly once on the other side of the switch.
        unsafe {
            let arg = encode_val(&mut val);
            let ptr = self.stack_ptr.as_ptr().cast::<StackPointer>();
            let ret = arch::switch_yield(arg, ptr);
            decode_val(ret)
        }
    }
}

impl<Input, Yield, Return, L: Default, S: FiberStack> Fiber<Input, Yield, Return, L, S> {
    /// Builds a fiber running `func` on `stack`, with a default-constructed
    /// fiber-local value.
    pub fn with_stack(
        stack: S,
        func: impl FnOnce(Input, &Suspend<Input, Yield>, &L) -> Return + 'static,
    ) -> Self {
        Self::with_stack_and_local(stack, L::default(), func)
    }
}

impl<Input, Yield, Return, L, S: FiberStack> Fiber<Input, Yield, Return, L, S> {
    /// Builds a fiber running `func` on `stack`, with the given fiber-local
    /// value.
    pub fn with_stack_and_local(
        stack: S,
        fiber_local: L,
        func: impl FnOnce(Input, &Suspend<Input, Yield>, &L) -> Return + 'static,
    ) -> Self {
        #[repr(C)]
        struct InitialObject<L, F> {
            fiber_local: L,
            func: MaybeUninit<F>,
        }

        unsafe extern "C-unwind" fn fiber_func<Input, Yield, Return, L, F>(
            input: EncodedValue,
            parent_link: &mut StackPointer,
            obj: *mut InitialObject<L, F>,
        ) -> !
        where
            F: FnOnce(Input, &Suspend<Input, Yield>, &L) -> Return,
        {
            // Safety: parent_link is #[repr(transparent)]-compatible with
            // Suspend<Input, Yield>.
            let suspend = unsafe { &*(std::ptr::from_mut(parent_link).cast::<Suspend<Input, Yield>>()) };
            // Safety: obj was constructed below and is valid until this point.
            let (fiber_local, func) = unsafe {
                let obj = &*obj;
                (&obj.fiber_local, obj.func.assume_init_read())
            };
            // Safety: input was encoded by Fiber::resume with the same Input.
            let input = unsafe { decode_val(input) };
            let result = func(input, suspend, fiber_local);
            let mut result = ManuallyDrop::new(result);
            // Safety: result will be decoded exactly once by the resumer.
            unsafe {
                let arg = encode_val(&mut result);
                arch::switch_and_reset(arg, std::ptr::from_mut(parent_link).cast());
            }
        }

        let obj = InitialObject {
            fiber_local,
            func: MaybeUninit::new(func),
        };

        // Safety: stack is a freshly constructed, unused FiberStack.
        let (stack_ptr, init_obj) = unsafe {
            arch::init_stack(
                &stack,
                fiber_func::<
                    Input,
                    Yield,
                    Return,
                    L,
                    impl FnOnce(Input, &Suspend<Input, Yield>, &L) -> Return,
                >,
                obj,
            )
        };

        let fiber_local_offset = std::mem::offset_of!(InitialObject<L, MaybeUninit<u8>>, fiber_local);
        let fiber_local = (init_obj.get() + fiber_local_offset) as *const L;

        Self {
            stack,
            stack_ptr: Some(stack_ptr),
            initial_stack_ptr: stack_ptr,
            fiber_local,
            marker: PhantomData,
            _not_send: PhantomData,
        }
    }

    /// Resumes the fiber with `input`, running until it either suspends or
    /// returns.
    ///
    /// # Panics
    ///
    /// Panics if the fiber has already run to completion.
    pub fn resume(&mut self, input: Input) -> FiberResult<Yield, Return> {
        let stack_ptr = self
            .stack_ptr
            .expect("attempt to resume a completed fiber");

        let mut input = ManuallyDrop::new(input);
        // Safety: switch_and_link hands control to either fiber_func on the
        // first resume, or to the point after the last Suspend::suspend call.
        let (result_val, new_stack_ptr) = unsafe {
            let arg = encode_val(&mut input);
            arch::switch_and_link(arg, stack_ptr, self.stack.top())
        };

        self.stack_ptr = new_stack_ptr;

        // Safety: result_val was encoded as either Yield (still running) or
        // Return (switch_and_reset), matching new_stack_ptr being Some/None.
        unsafe {
            if new_stack_ptr.is_some() {
                FiberResult::Yield(decode_val(result_val))
            } else {
                FiberResult::Return(decode_val(result_val))
            }
        }
    }

    /// `true` once the fiber has been resumed at least once.
    #[must_use]
    pub fn started(&self) -> bool {
        self.stack_ptr != Some(self.initial_stack_ptr)
    }

    /// `true` once the fiber has run to completion.
    #[must_use]
    pub fn done(&self) -> bool {
        self.stack_ptr.is_none()
    }

    /// Forcibly marks the fiber as completed without running it further.
    ///
    /// # Safety
    ///
    /// Leaks whatever state the fiber's body was holding at its last suspend
    /// point; the caller must ensure that state does not need to run its
    /// destructors.
    pub unsafe fn force_reset(&mut self) {
        self.stack_ptr = None;
    }

    /// The fiber-local value this fiber was constructed with.
    #[must_use]
    pub fn fiber_local(&self) -> &L {
        // Safety: fiber_local points into `self.stack`, valid for as long as
        // `self` exists.
        unsafe { &*self.fiber_local }
    }
}

impl<Input, Yield, Return, L, S: FiberStack> Drop for Fiber<Input, Yield, Return, L, S> {
    fn drop(&mut self) {
        assert!(
            self.done(),
            "dropped a fiber that had not run to completion"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_works() {
        let mut fiber = Fiber::<i32, i32, i32>::with_stack(
            DefaultFiberStack::default(),
            |mut input, suspend, _local: &()| {
                loop {
                    input = suspend.suspend(input * 2);
                    if input < 0 {
                        return input;
                    }
                }
            },
        );

        assert!(!fiber.started());
        assert_eq!(fiber.resume(1).into_yield(), Some(2));
        assert!(fiber.started());
        assert_eq!(fiber.resume(3).into_yield(), Some(6));
        assert_eq!(fiber.resume(-1).into_return(), Some(-1));
        assert!(fiber.done());
    }

    #[test]
    fn fiber_local() {
        let mut fiber = Fiber::<(), (), i32, i32>::with_stack_and_local(
            DefaultFiberStack::default(),
            42,
            |(), _suspend, local: &i32| *local,
        );
        assert_eq!(fiber.resume(()).into_return(), Some(42));
    }

    #[test]
    #[should_panic(expected = "attempt to resume a completed fiber")]
    fn resuming_a_completed_fiber_panics() {
        let mut fiber =
            Fiber::<(), (), (), ()>::with_stack(DefaultFiberStack::default(), |(), _, _| {});
        fiber.resume(());
        fiber.resume(());
    }
}
