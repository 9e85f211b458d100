//! Per-thread scoped temp allocation.
//!
//! Each thread owns a lazily-created bump arena; scopes are bracketed by
//! matched [`push_id`]/[`pop_id`] pairs and everything allocated inside a
//! scope dies when it pops. Scopes are strictly LIFO per thread.
//!
//! Fibers may hop threads at suspension points, which would silently tear a
//! temp scope in half. The protector records every scope opened while inside
//! a fiber; the scheduler calls [`assert_no_open_scopes`] at each suspension
//! point and dies loudly instead.

use crate::bump::BumpAllocator;
use crate::{Allocator, AllocatorKind};
use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::backtrace::Backtrace;

pub type TempId = u32;

/// Address space reserved per thread that uses temp allocation. Committed
/// lazily, so idle threads cost nothing but a reservation.
const TEMP_RESERVE: usize = 256 * 1024 * 1024;
const TEMP_PAGE: usize = 256 * 1024;

struct TempFrame {
    id: TempId,
    offset: usize,
}

struct ProtectorEntry {
    id: TempId,
    trace: Option<Backtrace>,
}

struct TempContext {
    bump: Option<BumpAllocator>,
    frames: Vec<TempFrame>,
    next_id: u32,
    protector: Vec<ProtectorEntry>,
}

impl TempContext {
    const fn new() -> Self {
        Self {
            bump: None,
            frames: Vec::new(),
            next_id: 1,
            protector: Vec::new(),
        }
    }

    fn bump(&mut self) -> &BumpAllocator {
        self.bump
            .get_or_insert_with(|| BumpAllocator::new(TEMP_RESERVE, TEMP_PAGE))
    }
}

thread_local! {
    static TEMP: RefCell<TempContext> = const { RefCell::new(TempContext::new()) };
}

static IN_FIBER_CHECK: AtomicUsize = AtomicUsize::new(0);
static CAPTURE_STACKTRACE: AtomicBool = AtomicBool::new(false);

/// Registers the scheduler's "is this thread inside a fiber" probe; the
/// protector only arms itself while it returns true.
pub fn register_fiber_check(check: fn() -> bool) {
    IN_FIBER_CHECK.store(check as usize, Ordering::Release);
}

/// When enabled, protector entries capture the callstack of the offending
/// `push_id` so the report names the scope that leaked across a suspension.
pub fn set_capture_stacktrace(enable: bool) {
    CAPTURE_STACKTRACE.store(enable, Ordering::Relaxed);
}

fn in_fiber() -> bool {
    let raw = IN_FIBER_CHECK.load(Ordering::Acquire);
    if raw == 0 {
        return false;
    }
    // Safety: only `fn() -> bool` pointers are ever stored.
    let check: fn() -> bool = unsafe { core::mem::transmute::<usize, fn() -> bool>(raw) };
    check()
}

/// Opens a temp scope on the calling thread and returns its id.
#[must_use]
pub fn push_id() -> TempId {
    TEMP.with(|tls| {
        let mut ctx = tls.borrow_mut();
        let id = ctx.next_id;
        ctx.next_id = ctx.next_id.wrapping_add(1).max(1);
        let offset = ctx.bump().offset();
        ctx.frames.push(TempFrame { id, offset });

        if in_fiber() {
            let trace = CAPTURE_STACKTRACE
                .load(Ordering::Relaxed)
                .then(Backtrace::force_capture);
            ctx.protector.push(ProtectorEntry { id, trace });
        }
        id
    })
}

/// Closes the top scope; `id` must match it.
pub fn pop_id(id: TempId) {
    TEMP.with(|tls| {
        let mut ctx = tls.borrow_mut();
        let frame = ctx.frames.pop().expect("temp scope stack is empty");
        assert_eq!(
            frame.id, id,
            "temp scopes must pop in LIFO order on the thread that pushed them"
        );
        ctx.bump().rewind(frame.offset);

        if let Some(i) = ctx.protector.iter().position(|e| e.id == id) {
            ctx.protector.swap_remove(i);
        }
    });
}

/// Allocates against the top scope; `id` must be the top scope's id.
pub fn alloc(id: TempId, size: usize, align: usize) -> *mut u8 {
    TEMP.with(|tls| {
        let mut ctx = tls.borrow_mut();
        assert_current_frame(&ctx, id);
        ctx.bump().alloc(size, align)
    })
}

pub fn realloc(id: TempId, ptr: *mut u8, size: usize, align: usize) -> *mut u8 {
    TEMP.with(|tls| {
        let mut ctx = tls.borrow_mut();
        assert_current_frame(&ctx, id);
        ctx.bump().realloc(ptr, size, align)
    })
}

fn assert_current_frame(ctx: &TempContext, id: TempId) {
    let top = ctx.frames.last().expect("no open temp scope");
    assert_eq!(top.id, id, "temp allocation against a non-top scope");
}

/// Current bump offset of the calling thread's temp arena.
pub fn offset() -> usize {
    TEMP.with(|tls| tls.borrow().bump.as_ref().map_or(0, BumpAllocator::offset))
}

/// Dies if the calling thread has a temp scope open inside a fiber. Called
/// by the scheduler at every suspension point: a scope crossing a suspension
/// would pop on a different thread than it pushed on.
pub fn assert_no_open_scopes() {
    TEMP.with(|tls| {
        let ctx = tls.borrow();
        if ctx.protector.is_empty() {
            return;
        }
        for entry in &ctx.protector {
            match &entry.trace {
                Some(trace) => {
                    tracing::error!(id = entry.id, %trace, "temp scope open across fiber suspension");
                }
                None => tracing::error!(id = entry.id, "temp scope open across fiber suspension"),
            }
        }
        panic!("temp allocator scope held across a fiber suspension point");
    });
}

/// RAII temp scope that doubles as an [`Allocator`].
pub struct TempAllocator {
    id: TempId,
    owns_id: bool,
}

impl TempAllocator {
    /// Opens a fresh scope.
    pub fn new() -> Self {
        Self {
            id: push_id(),
            owns_id: true,
        }
    }

    /// Borrows an already-open scope; dropping this value does not close it.
    pub fn from_id(id: TempId) -> Self {
        Self { id, owns_id: false }
    }

    pub fn id(&self) -> TempId {
        self.id
    }

    /// Offset of the calling thread's arena, for scope-reuse checks.
    pub fn offset(&self) -> usize {
        offset()
    }
}

impl Default for TempAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for TempAllocator {
    fn alloc(&self, size: usize, align: usize) -> *mut u8 {
        alloc(self.id, size, align)
    }

    fn realloc(&self, ptr: *mut u8, size: usize, align: usize) -> *mut u8 {
        realloc(self.id, ptr, size, align)
    }

    fn free(&self, _ptr: *mut u8, _align: usize) {
        // Scope-lifetime allocation; nothing to do.
    }

    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Temp
    }
}

impl Drop for TempAllocator {
    fn drop(&mut self) {
        if self.owns_id {
            pop_id(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MACHINE_ALIGN, alloc_or_fail};

    const MB: usize = 1024 * 1024;

    #[test]
    fn scope_rewinds_offset() {
        let before = offset();

        let id = push_id();
        for _ in 0..3 {
            let p = alloc(id, MB, MACHINE_ALIGN);
            assert!(!p.is_null());
            // Safety: block is committed and scope-live.
            unsafe { p.write_bytes(0xF0, MB) };
        }
        assert!(offset() >= before + 3 * MB);
        pop_id(id);

        assert_eq!(offset(), before);

        // A fresh scope starts from the rewound offset.
        let id = push_id();
        let _ = alloc(id, 64, MACHINE_ALIGN);
        assert!(offset() <= before + 64 + MACHINE_ALIGN);
        pop_id(id);
        assert_eq!(offset(), before);
    }

    #[test]
    fn raii_scope() {
        let before = offset();
        {
            let temp = TempAllocator::new();
            let p = alloc_or_fail(&temp, 4096, MACHINE_ALIGN);
            // Safety: scope-live block.
            unsafe { p.as_ptr().write_bytes(0xAB, 4096) };
            assert!(temp.offset() > before);
        }
        assert_eq!(offset(), before);
    }

    #[test]
    fn nested_scopes_are_lifo() {
        let outer = push_id();
        let a = alloc(outer, 128, MACHINE_ALIGN);
        let inner = push_id();
        let _b = alloc(inner, 128, MACHINE_ALIGN);
        pop_id(inner);
        // The outer scope's allocation survives the inner pop.
        // Safety: outer scope still open.
        unsafe { a.write_bytes(0x5C, 128) };
        pop_id(outer);
    }

    #[test]
    #[should_panic(expected = "LIFO")]
    fn out_of_order_pop_dies() {
        let a = push_id();
        let b = push_id();
        // Popping the outer scope first is a bug.
        pop_id(a);
        let _ = b;
    }
}
