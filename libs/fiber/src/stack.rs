//! Stacks a fiber can run on.
//!
//! [`OsStack`] maps its own memory with a guard page and is what standalone
//! users want. The scheduler instead carves fiber stacks out of its private
//! heap and brings its own [`FiberStack`] implementation.

use crate::StackPointer;
use std::io;
use std::ptr;

/// Minimum usable stack size, excluding guard pages.
pub const MIN_STACK_SIZE: usize = 4096;

/// Memory a fiber executes on.
///
/// # Safety
///
/// `top` and `bottom` must delimit memory that stays valid and writable
/// (modulo guard pages at the bottom) for the implementor's lifetime, with
/// `top` aligned to [`STACK_ALIGNMENT`](crate::STACK_ALIGNMENT).
pub unsafe trait FiberStack {
    /// Highest address of the stack; execution starts here and grows down.
    fn top(&self) -> StackPointer;

    /// Lowest address, including any guard pages.
    fn bottom(&self) -> StackPointer;
}

// Safety: forwards to the underlying stack.
unsafe impl<S: FiberStack> FiberStack for &mut S {
    #[inline]
    fn top(&self) -> StackPointer {
        (**self).top()
    }

    #[inline]
    fn bottom(&self) -> StackPointer {
        (**self).bottom()
    }
}

/// An mmap'd stack with one inaccessible guard page at the bottom, so an
/// overflow faults instead of corrupting a neighbor.
pub struct OsStack {
    top: StackPointer,
    mmap_len: usize,
}

// Safety: plain owned memory.
unsafe impl Send for OsStack {}

impl OsStack {
    /// Maps a stack with at least `size` usable bytes.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the mapping or protection change fails.
    pub fn new(size: usize) -> io::Result<Self> {
        let size = size.max(MIN_STACK_SIZE);

        // One guard page plus page-granular rounding.
        let page_size = page_size();
        let mmap_len = size
            .checked_add(page_size * 2 - 1)
            .expect("stack size overflow")
            & !(page_size - 1);

        // Safety: anonymous private mapping.
        unsafe {
            let mmap = libc::mmap(
                ptr::null_mut(),
                mmap_len,
                libc::PROT_NONE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            );
            if mmap == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }

            let out = Self {
                top: StackPointer::new(mmap as usize + mmap_len).unwrap(),
                mmap_len,
            };

            // Everything above the guard page becomes usable.
            if libc::mprotect(
                mmap.cast::<u8>().add(page_size).cast(),
                mmap_len - page_size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                return Err(io::Error::last_os_error());
            }

            Ok(out)
        }
    }

    /// Usable bytes above the guard page.
    pub fn len(&self) -> usize {
        self.mmap_len - page_size()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl Drop for OsStack {
    fn drop(&mut self) {
        // Safety: unmapping the exact range we mapped.
        unsafe {
            let mmap = self.top.get() - self.mmap_len;
            let ret = libc::munmap(mmap as *mut libc::c_void, self.mmap_len);
            debug_assert_eq!(ret, 0);
        }
    }
}

// Safety: top/bottom delimit the mapping; top is page-aligned which
// satisfies STACK_ALIGNMENT.
unsafe impl FiberStack for OsStack {
    fn top(&self) -> StackPointer {
        self.top
    }

    fn bottom(&self) -> StackPointer {
        StackPointer::new(self.top.get() - self.mmap_len).unwrap()
    }
}

fn page_size() -> usize {
    // Safety: sysconf is always callable.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    debug_assert!(page_size.is_power_of_two());
    page_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_and_aligns() {
        let stack = OsStack::new(128 * 1024).unwrap();
        assert_eq!(stack.top().get() % crate::STACK_ALIGNMENT, 0);
        assert!(stack.top().get() > stack.bottom().get());
        assert!(stack.len() >= 128 * 1024);
    }

    #[test]
    fn tiny_requests_get_the_minimum() {
        let stack = OsStack::new(1).unwrap();
        assert!(stack.len() >= MIN_STACK_SIZE);
    }
}
