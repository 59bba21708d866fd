// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use ember_alloc::{AllocError, Allocator, Owns};
use std::alloc::Layout;
use std::ptr::NonNull;

/// Allocates from a primary allocator first, falling back to a secondary
/// one when the primary is exhausted.
///
/// The canonical use is `Fallback<Arena, Global>`: try the fast bump arena,
/// and only reach for the process heap once the arena's fixed capacity runs
/// out. `deallocate` routes each pointer back to whichever upstream produced
/// it via [`Owns`], so the primary does not need to be probed first (its
/// `owns` is cheap: a single range check).
pub struct Fallback<P, S> {
    primary: P,
    secondary: S,
}

impl<P, S> Fallback<P, S> {
    /// Builds a fallback allocator trying `primary` before `secondary`.
    pub fn new(primary: P, secondary: S) -> Self {
        Self { primary, secondary }
    }

    /// Borrows the primary allocator.
    pub fn primary(&self) -> &P {
        &self.primary
    }

    /// Borrows the secondary allocator.
    pub fn secondary(&self) -> &S {
        &self.secondary
    }
}

unsafe impl<P, S> Allocator for Fallback<P, S>
where
    P: Allocator,
    S: Allocator,
{
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        self.primary
            .allocate(layout)
            .or_else(|_| self.secondary.allocate(layout))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: forwarded from the caller's contract; `ptr`/`layout` came
        // from either `self.primary.allocate` or `self.secondary.allocate`,
        // and `owns` below determines which.
        unsafe {
            if self.primary.owns(ptr) {
                self.primary.deallocate(ptr, layout);
            } else {
                self.secondary.deallocate(ptr, layout);
            }
        }
    }
}

impl<P, S> Owns for Fallback<P, S>
where
    P: Allocator + Owns,
    S: Allocator,
{
    fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.primary.owns(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Arena;
    use ember_alloc::Global;

    #[test]
    fn uses_primary_while_it_has_room() {
        let fb = Fallback::new(Arena::new(128), Global);
        let layout = Layout::from_size_align(32, 8).unwrap();
        let ptr = fb.allocate(layout).unwrap();
        assert!(fb.primary().owns(NonNull::new(ptr.as_ptr().cast::<u8>()).unwrap()));
        unsafe { fb.deallocate(NonNull::new(ptr.as_ptr().cast::<u8>()).unwrap(), layout) };
    }

    #[test]
    fn spills_to_secondary_on_exhaustion() {
        let fb = Fallback::new(Arena::new(16), Global);
        let layout = Layout::from_size_align(64, 8).unwrap();
        let ptr = fb.allocate(layout).unwrap();
        let raw = NonNull::new(ptr.as_ptr().cast::<u8>()).unwrap();
        assert!(!fb.primary().owns(raw));
        unsafe { fb.deallocate(raw, layout) };
    }
}
