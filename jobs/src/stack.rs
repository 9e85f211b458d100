//! Fiber stacks carved out of the scheduler's private TLSF heap.
//!
//! Worker fibers die concurrently, so the heap behind these is the
//! spinlocked [`mem::TlsfAllocatorTs`]. No guard pages: overflow protection
//! comes from sizing (the dispatch API takes a per-job stack size).

use core::ptr::NonNull;
use fiber::{FiberStack, STACK_ALIGNMENT, StackPointer};
use mem::{Allocator, TlsfAllocatorTs, alloc_or_fail};

pub(crate) struct PooledStack {
    base: NonNull<u8>,
    size: usize,
    /// The heap the stack came from; `None` means the process default heap
    /// (test stacks).
    heap: Option<NonNull<TlsfAllocatorTs>>,
}

// Safety: plain owned memory; the heap pointer is only dereferenced to free.
unsafe impl Send for PooledStack {}

impl PooledStack {
    /// Carves a stack out of `heap`.
    ///
    /// # Safety
    ///
    /// `heap` must outlive the returned stack; the scheduler guarantees this
    /// by joining every worker before tearing its heap down.
    pub(crate) unsafe fn new(heap: &TlsfAllocatorTs, size: usize) -> Self {
        let size = size.max(fiber::stack::MIN_STACK_SIZE).next_multiple_of(STACK_ALIGNMENT);
        let base = alloc_or_fail(heap, size, STACK_ALIGNMENT);
        Self {
            base,
            size,
            heap: Some(NonNull::from(heap)),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(size: usize) -> Self {
        let size = size.max(fiber::stack::MIN_STACK_SIZE).next_multiple_of(STACK_ALIGNMENT);
        Self {
            base: alloc_or_fail(mem::default_alloc(), size, STACK_ALIGNMENT),
            size,
            heap: None,
        }
    }
}

impl Drop for PooledStack {
    fn drop(&mut self) {
        match self.heap {
            // Safety: the heap outlives every stack handed out of it.
            Some(heap) => unsafe { heap.as_ref() }.free(self.base.as_ptr(), STACK_ALIGNMENT),
            None => mem::default_alloc().free(self.base.as_ptr(), STACK_ALIGNMENT),
        }
    }
}

// Safety: base is STACK_ALIGNMENT-aligned and size a multiple of it, so the
// top is aligned; the memory stays valid for the stack's lifetime.
unsafe impl FiberStack for PooledStack {
    fn top(&self) -> StackPointer {
        StackPointer::new(self.base.as_ptr() as usize + self.size).unwrap()
    }

    fn bottom(&self) -> StackPointer {
        StackPointer::new(self.base.as_ptr() as usize).unwrap()
    }
}
