// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::{FiberStack, StackPointer, MIN_STACK_SIZE};
use std::io;
use std::ptr;

/// A fiber stack allocated with `mmap`, with a `PROT_NONE` guard page at the
/// low end to turn a stack overflow into a `SIGSEGV` instead of silent
/// corruption of whatever memory happens to sit below it.
pub struct DefaultFiberStack {
    top: StackPointer,
    mmap_base: *mut libc::c_void,
    mmap_len: usize,
}

// Safety: the mmap'd region is exclusively owned by this `DefaultFiberStack`.
unsafe impl Send for DefaultFiberStack {}

impl DefaultFiberStack {
    /// Allocates a new stack of at least `size` bytes, rounded up to the
    /// nearest page and to [`MIN_STACK_SIZE`].
    pub fn new(size: usize) -> io::Result<Self> {
        let page_size = page_size();
        let size = size.max(MIN_STACK_SIZE);
        let size = (size + page_size - 1) / page_size * page_size;
        let mmap_len = size + page_size;

        // Safety: mmap with MAP_PRIVATE | MAP_ANONYMOUS never reads fd/offset.
        let mmap_base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mmap_len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if mmap_base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // Safety: mmap_base..mmap_base+mmap_len was just mapped above; the
        // first page stays PROT_NONE as the guard page.
        let usable = unsafe { mmap_base.cast::<u8>().add(page_size) };
        let rc = unsafe { libc::mprotect(usable.cast(), size, libc::PROT_READ | libc::PROT_WRITE) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            // Safety: mmap_base/mmap_len describe the region just mapped.
            unsafe {
                libc::munmap(mmap_base, mmap_len);
            }
            return Err(err);
        }

        let top = usable as usize + size;
        Ok(Self {
            // Safety: top is a non-null usable address within the mapping.
            top: unsafe { StackPointer::new_unchecked(top) },
            mmap_base,
            mmap_len,
        })
    }
}

impl Default for DefaultFiberStack {
    fn default() -> Self {
        Self::new(1024 * 1024).expect("failed to allocate fiber stack")
    }
}

impl Drop for DefaultFiberStack {
    fn drop(&mut self) {
        // Safety: mmap_base/mmap_len describe exactly the mapping created in
        // `new`, and no other code holds a reference to it once this fiber's
        // stack has been dropped (enforced by `Fiber::drop` requiring `done()`).
        unsafe {
            libc::munmap(self.mmap_base, self.mmap_len);
        }
    }
}

// Safety: top()/bottom() describe the writable range mmap'd above,
// PROT_NONE-guarded below `bottom()`.
unsafe impl FiberStack for DefaultFiberStack {
    fn top(&self) -> StackPointer {
        self.top
    }

    fn bottom(&self) -> StackPointer {
        // Safety: mmap_len always exceeds top - bottom by the guard page.
        unsafe { StackPointer::new_unchecked(self.top.get() - (self.mmap_len - page_size())) }
    }
}

fn page_size() -> usize {
    // Safety: sysconf with a valid name is always safe to call.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).expect("sysconf(_SC_PAGESIZE) returned a negative value")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_and_frees_a_stack() {
        let stack = DefaultFiberStack::new(MIN_STACK_SIZE).unwrap();
        assert!(stack.top().get() > stack.bottom().get());
        assert!(stack.top().get() - stack.bottom().get() >= MIN_STACK_SIZE);
    }

    #[test]
    fn default_stack_is_one_megabyte() {
        let stack = DefaultFiberStack::default();
        assert_eq!(stack.top().get() - stack.bottom().get(), 1024 * 1024);
    }
}
