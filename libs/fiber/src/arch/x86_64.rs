//! x86_64 System V context switching.
//!
//! ## Stack layout
//!
//! A suspended fiber's stack, from the base down:
//!
//! ```text
//! +--------------+  <- stack base (top())
//! | Initial func |
//! +--------------+
//! | Parent link  |     resumer's saved RSP, refreshed on every switch-in
//! +--------------+
//! |     ...      |
//! +--------------+
//! | Saved PC     |
//! +--------------+
//! | Saved RBX    |
//! +--------------+
//! | Saved RBP    |  <- saved stack pointer
//! +--------------+
//! ```
//!
//! RBX and RBP are LLVM-reserved registers and cannot appear in clobber
//! lists, so the assembly saves and restores them by hand; every other
//! callee-saved register is a declared clobber, which lets the compiler
//! batch saves across consecutive switches.

use crate::{FiberStack, StackPointer, allocate_obj_on_stack, push};
use core::arch::{asm, naked_asm};

pub const STACK_ALIGNMENT: usize = 16;

/// Seeds a fresh stack so the first [`switch_and_link`] enters
/// `stack_init_trampoline`, which in turn tail-calls `func` with the parent
/// link and the address of `obj`.
#[inline]
pub unsafe fn init_stack<T>(
    stack: &dyn FiberStack,
    func: unsafe extern "C" fn(arg: usize, sp: &mut StackPointer, obj: *mut T) -> !,
    obj: T,
) -> StackPointer {
    // Safety: the stack is unused and MIN_STACK_SIZE covers this prologue.
    unsafe {
        let mut sp = stack.top().get();

        // Initial function, read by the trampoline.
        push(&mut sp, Some(func as usize));

        // Parent link placeholder, filled in on every switch-in.
        push(&mut sp, None);

        // The initial object travels on the stack so no allocation is
        // needed; the trampoline passes its address as the 3rd argument.
        allocate_obj_on_stack(&mut sp, 16, obj);

        // Entry point for the first switch_and_link.
        push(&mut sp, Some(stack_init_trampoline as usize));

        StackPointer::new_unchecked(sp)
    }
}

#[unsafe(naked)]
unsafe extern "C" fn stack_init_trampoline() {
    naked_asm! {
        ".balign 16",
        // Entered via the CALL in switch_and_link the first time a fiber
        // runs. Register state:
        // - RSP points at the parent stack (return address pushed).
        // - RDX points at the fiber stack top (this function's address).
        // - RSI holds the fiber stack base.
        // - RDI carries the argument.
        //
        // Complete the parent frame record so the frame-pointer chain stays
        // walkable from inside the fiber.
        "push rbp",
        // Fill in the parent link below the stack base.
        "mov [rsi - 16], rsp",
        // The entry function's 2nd argument is the parent link itself.
        "sub rsi, 16",
        // Hop onto the fiber stack, skipping the trampoline address.
        "lea rsp, [rdx + 8]",
        // Frame pointer roots at the parent link.
        "mov rbp, rsi",
        // 3rd argument: the initial object placed by init_stack.
        "mov rdx, rsp",
        // Hand-rolled call: push a return target and JMP, keeping the CPU's
        // return predictor aligned with the RETs in switch_yield /
        // switch_and_reset.
        "lea rcx, [rip + 2f]",
        "push rcx",
        // The initial function sits just above the parent link.
        "jmp [rsi + 8]",
        // Never reached; the entry function does not return.
        "2:",
        "ud2",
    }
}

/// Switches onto a fiber and records the parent context so the fiber can
/// switch back. Returns the argument passed out by the fiber and its new
/// stack pointer, or `None` if it finished.
#[inline]
pub unsafe fn switch_and_link(
    arg0: usize,
    sp: StackPointer,
    top_of_stack: StackPointer,
) -> (usize, Option<StackPointer>) {
    let (ret_val, ret_sp);

    // Safety: sp is a context produced by init_stack or switch_yield on a
    // live fiber stack.
    unsafe {
        asm! {
            // RBX is LLVM-reserved; save it by hand.
            "push rbx",

            // Enter the fiber: either stack_init_trampoline or the resume
            // point inside switch_yield.
            "call [rdx]",

            // Back from the fiber. RSI carries its stack pointer (0 when it
            // finished), RDI the argument it passed out.
            "pop rbx",

            inlateout("rdi") arg0 => ret_val,
            lateout("rsi") ret_sp,
            in("rsi") top_of_stack.get() as u64,
            in("rdx") sp.get() as u64,
            lateout("r12") _, lateout("r13") _, lateout("r14") _, lateout("r15") _,
            clobber_abi("sysv64"),
        }
    }

    (ret_val, StackPointer::new(ret_sp))
}

/// Suspends the current fiber: saves its context and returns to the parent
/// recorded in `parent_link`. Returns the argument of the next resume.
#[inline(always)]
pub unsafe fn switch_yield(arg: usize, parent_link: *mut StackPointer) -> usize {
    let ret_val;

    // Safety: parent_link was filled in by switch_and_link on this stack.
    unsafe {
        asm! {
            // RBP/RBX are LLVM-reserved; save by hand.
            "push rbp",
            "push rbx",

            // Resume point for the next switch_and_link.
            "lea rax, [rip + 2f]",
            "push rax",

            // Publish our stack pointer and return into the parent context.
            "mov rsi, rsp",
            "mov rsp, [rdx]",
            "pop rbp",
            "ret",

            // Resumed: mirror image of the suspend above. RSI holds our
            // stack base, RDX our saved stack pointer.
            "2:",
            "push rbp",
            "mov [rsi - 16], rsp",
            "lea rsp, [rdx + 8]",
            "pop rbx",
            "pop rbp",

            inlateout("rdi") arg => ret_val,
            in("rdx") parent_link as u64,
            lateout("r12") _, lateout("r13") _, lateout("r14") _, lateout("r15") _,
            clobber_abi("sysv64"),
        }
    }

    ret_val
}

/// Leaves a finishing fiber for good: returns to the parent with a null
/// saved-stack-pointer so the resumer reports completion.
#[inline(always)]
pub unsafe fn switch_and_reset(arg: usize, parent_link: *mut StackPointer) -> ! {
    // Safety: parent_link holds the resumer's context; this stack is dead
    // after the RET.
    unsafe {
        asm! {
            "mov rsp, [{parent_link}]",
            "pop rbp",
            "ret",

            parent_link = in(reg) parent_link as u64,
            in("rdi") arg,
            // A zero stack pointer tells switch_and_link the fiber is done.
            in("rsi") 0,
            options(noreturn),
        }
    }
}
