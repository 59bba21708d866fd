// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::mem::{self, ManuallyDrop};

/// A machine word used to pass values across a fiber switch. Values that fit
/// are encoded inline; larger ones are boxed and their pointer encoded
/// instead.
pub type EncodedValue = usize;

/// Encodes `val` for a fiber switch, consuming it.
///
/// # Safety
///
/// The caller must ensure the returned value is eventually passed to
/// [`decode_val`] with the same `T`, exactly once.
pub unsafe fn encode_val<T>(val: &mut ManuallyDrop<T>) -> EncodedValue {
    if mem::size_of::<T>() <= mem::size_of::<EncodedValue>() {
        // Safety: caller ensures this is read back with decode_val::<T>.
        unsafe {
            let mut out: EncodedValue = 0;
            std::ptr::copy_nonoverlapping(
                (val as *mut ManuallyDrop<T>).cast::<u8>(),
                std::ptr::from_mut(&mut out).cast::<u8>(),
                mem::size_of::<T>(),
            );
            out
        }
    } else {
        Box::into_raw(Box::new(ManuallyDrop::take(val))) as EncodedValue
    }
}

/// Decodes a value previously encoded by [`encode_val`].
///
/// # Safety
///
/// `val` must have been produced by [`encode_val`] with the same `T`, and
/// must not be decoded more than once.
pub unsafe fn decode_val<T>(val: EncodedValue) -> T {
    if mem::size_of::<T>() <= mem::size_of::<EncodedValue>() {
        // Safety: caller upholds the encode_val contract.
        unsafe {
            let mut out = mem::MaybeUninit::<T>::uninit();
            std::ptr::copy_nonoverlapping(
                std::ptr::from_ref(&val).cast::<u8>(),
                out.as_mut_ptr().cast::<u8>(),
                mem::size_of::<T>(),
            );
            out.assume_init()
        }
    } else {
        // Safety: caller upholds the encode_val contract.
        unsafe { *Box::from_raw(val as *mut T) }
    }
}

/// Pushes a word onto the stack growing down from `sp`, optionally writing
/// `val` to the new top.
///
/// # Safety
///
/// `sp` must point into a writable stack region with at least one word of
/// headroom below it.
pub unsafe fn push(sp: &mut usize, val: Option<usize>) {
    *sp -= mem::size_of::<usize>();
    if let Some(val) = val {
        // Safety: caller ensures *sp is writable.
        unsafe {
            (*sp as *mut usize).write(val);
        }
    }
}

/// Writes `obj` onto the stack growing down from `sp`, aligning `sp` to
/// `obj`'s alignment (relative to `sp_offset`) beforehand.
///
/// # Safety
///
/// `sp` must point into a writable stack region with enough headroom for
/// `T` plus alignment padding.
pub unsafe fn allocate_obj_on_stack<T>(sp: &mut usize, sp_offset: usize, obj: T) {
    assert!(mem::size_of::<T>() <= 1024);

    *sp -= mem::size_of::<T>();
    *sp -= (*sp + sp_offset) % mem::align_of::<T>().max(1);

    // Safety: caller ensures the region below *sp is writable and large
    // enough for T after the alignment adjustment above.
    unsafe {
        (*sp as *mut T).write(obj);
    }
}
