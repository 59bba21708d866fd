// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Small standalone helpers shared across the execution and asynchrony crates.

mod cache_padded;

pub use cache_padded::CachePadded;

use std::ptr::NonNull;

/// Wraps `NonNull::new(ptr).unwrap()`, but with a clearer panic message in
/// debug builds. In release builds the check is skipped and the cast is
/// assumed to hold, matching the call sites' invariants (a pointer freshly
/// returned by an allocator, or offset from one that was already non-null).
///
/// # Safety
///
/// The caller must ensure `ptr` is in fact non-null.
#[inline]
pub unsafe fn non_null<T>(ptr: *mut T) -> NonNull<T> {
    debug_assert!(!ptr.is_null(), "expected non-null pointer");
    unsafe { NonNull::new_unchecked(ptr) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_padded_derefs_to_inner() {
        let padded = CachePadded::from(42u32);
        assert_eq!(*padded, 42);
    }

    #[test]
    fn cache_padded_is_at_least_one_word() {
        assert!(std::mem::size_of::<CachePadded<u8>>() >= std::mem::size_of::<u8>());
    }

    #[test]
    fn non_null_roundtrips() {
        let mut x = 5i32;
        let nn = unsafe { non_null(&mut x as *mut i32) };
        assert_eq!(unsafe { *nn.as_ptr() }, 5);
    }
}
