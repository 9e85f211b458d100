//! Bump allocation over a reserved virtual-memory range.
//!
//! The allocator reserves its whole range up front and commits pages lazily
//! as the high-water mark crosses them. `reset` rewinds the offset without
//! decommitting, so a reset-per-frame arena stays warm.
//!
//! Invariant: `offset <= committed <= reserved`.

use crate::{Allocator, AllocatorKind, align_up};
use core::ptr;

struct BumpState {
    base: *mut u8,
    reserved: usize,
    committed: usize,
    page_size: usize,
    offset: usize,
    last_ptr: *mut u8,
}

pub struct BumpAllocator {
    state: spin::Mutex<BumpState>,
}

// Safety: all state is behind the spin mutex; the mapping itself is
// plain memory.
unsafe impl Send for BumpAllocator {}
unsafe impl Sync for BumpAllocator {}

impl BumpAllocator {
    /// Reserves `reserve_size` bytes of address space. `page_size` is the
    /// commit granularity and is rounded up to a multiple of the OS page.
    pub fn new(reserve_size: usize, page_size: usize) -> Self {
        let os_page = sys::vmem::page_size();
        let page_size = align_up(page_size.max(os_page), os_page);
        let reserved = align_up(reserve_size, page_size);
        let base = sys::vmem::reserve(reserved, sys::VmFlags::empty());

        Self {
            state: spin::Mutex::new(BumpState {
                base,
                reserved,
                committed: 0,
                page_size,
                offset: 0,
                last_ptr: ptr::null_mut(),
            }),
        }
    }

    pub fn offset(&self) -> usize {
        self.state.lock().offset
    }

    pub fn committed_size(&self) -> usize {
        self.state.lock().committed
    }

    pub fn reserved_size(&self) -> usize {
        self.state.lock().reserved
    }

    /// Rewinds the offset to zero. Committed pages stay committed.
    pub fn reset(&self) {
        self.rewind(0);
    }

    /// Rewinds to an offset previously returned by [`offset`](Self::offset).
    /// Committed pages stay committed.
    pub fn rewind(&self, offset: usize) {
        let mut state = self.state.lock();
        assert!(offset <= state.offset);
        state.offset = offset;
        state.last_ptr = ptr::null_mut();
    }

    fn alloc_inner(state: &mut BumpState, size: usize, align: usize) -> *mut u8 {
        debug_assert!(align.is_power_of_two() && align <= state.page_size);

        let offset = align_up(state.offset, align);
        let end = offset + size;
        if end > state.reserved {
            return ptr::null_mut();
        }
        if end > state.committed {
            let target = align_up(end, state.page_size).min(state.reserved);
            // Safety: [base+committed, base+target) is inside our
            // reservation.
            unsafe {
                sys::vmem::commit(state.base.add(state.committed), target - state.committed);
            }
            state.committed = target;
        }

        // Safety: offset stays within the committed range.
        let ptr = unsafe { state.base.add(offset) };
        state.offset = end;
        state.last_ptr = ptr;
        ptr
    }
}

impl Allocator for BumpAllocator {
    fn alloc(&self, size: usize, align: usize) -> *mut u8 {
        Self::alloc_inner(&mut self.state.lock(), size, align)
    }

    fn realloc(&self, ptr: *mut u8, size: usize, align: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc(size, align);
        }

        let mut state = self.state.lock();
        if ptr == state.last_ptr {
            // Grow or shrink the most recent allocation in place.
            let start = ptr as usize - state.base as usize;
            let end = start + size;
            if end > state.reserved {
                return ptr::null_mut();
            }
            if end > state.committed {
                let target = align_up(end, state.page_size).min(state.reserved);
                // Safety: range is inside the reservation.
                unsafe {
                    sys::vmem::commit(state.base.add(state.committed), target - state.committed);
                }
                state.committed = target;
            }
            state.offset = end;
            return ptr;
        }

        // Not the top allocation: hand out a fresh block. The old block's
        // length is unknown here, so the copy is bounded by the distance to
        // the current offset, which always covers it.
        let old_span = state.offset - (ptr as usize - state.base as usize);
        let fresh = Self::alloc_inner(&mut state, size, align);
        if !fresh.is_null() {
            // Safety: both ranges are committed and non-overlapping.
            unsafe { ptr::copy_nonoverlapping(ptr, fresh, size.min(old_span)) };
        }
        fresh
    }

    fn free(&self, _ptr: *mut u8, _align: usize) {
        // Individual frees are no-ops; lifetime ends at reset or drop.
    }

    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Bump
    }
}

impl Drop for BumpAllocator {
    fn drop(&mut self) {
        let state = self.state.lock();
        sys::vmem::release(state.base, state.reserved);
    }
}

/// A bump arena with an explicit commit ceiling and a name for diagnostics.
pub struct BudgetAllocator {
    bump: BumpAllocator,
    name: &'static str,
    budget: usize,
    warned: core::sync::atomic::AtomicBool,
}

impl BudgetAllocator {
    pub fn new(name: &'static str, budget: usize, page_size: usize, commit_all: bool) -> Self {
        let bump = BumpAllocator::new(budget, page_size);
        if commit_all {
            let mut state = bump.state.lock();
            sys::vmem::commit(state.base, state.reserved);
            state.committed = state.reserved;
        }
        Self {
            bump,
            name,
            budget,
            warned: core::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn offset(&self) -> usize {
        self.bump.offset()
    }

    pub fn committed_size(&self) -> usize {
        self.bump.committed_size()
    }

    pub fn total_size(&self) -> usize {
        self.budget
    }

    fn check_watermark(&self) {
        use core::sync::atomic::Ordering;
        if self.bump.offset() > self.budget / 5 * 4 && !self.warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                name = self.name,
                offset = self.bump.offset(),
                budget = self.budget,
                "budget allocator crossed 80% of its ceiling"
            );
        }
    }
}

impl Allocator for BudgetAllocator {
    fn alloc(&self, size: usize, align: usize) -> *mut u8 {
        let ptr = self.bump.alloc(size, align);
        self.check_watermark();
        ptr
    }

    fn realloc(&self, ptr: *mut u8, size: usize, align: usize) -> *mut u8 {
        let ptr = self.bump.realloc(ptr, size, align);
        self.check_watermark();
        ptr
    }

    fn free(&self, ptr: *mut u8, align: usize) {
        self.bump.free(ptr, align);
    }

    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Bump
    }
}
