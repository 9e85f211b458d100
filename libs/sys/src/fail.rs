//! Process-global out-of-memory hook.
//!
//! Allocation failure anywhere in the runtime is unrecoverable: the installed
//! callback gets one chance to flush logs or dump budgets, then the process
//! asserts. There is no unwinding path out of an allocator.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Invoked right before the process aborts on an allocation failure.
pub type FailCallback = fn();

static FAIL_CALLBACK: AtomicUsize = AtomicUsize::new(0);

/// Installs the process-global failure callback. Pass `None` to clear it.
pub fn set_fail_callback(callback: Option<FailCallback>) {
    let raw = callback.map_or(0, |f| f as usize);
    FAIL_CALLBACK.store(raw, Ordering::Release);
}

/// Runs the installed callback, if any.
pub fn run_fail_callback() {
    let raw = FAIL_CALLBACK.load(Ordering::Acquire);
    if raw != 0 {
        // Safety: the only non-zero values ever stored are `fn()` pointers.
        let f: FailCallback = unsafe { core::mem::transmute::<usize, FailCallback>(raw) };
        f();
    }
}

/// Terminal path for reserve/commit/alloc failures.
#[cold]
pub fn memory_fail() -> ! {
    run_fail_callback();
    panic!("out of memory");
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicBool;

    static RAN: AtomicBool = AtomicBool::new(false);

    #[test]
    fn callback_runs() {
        set_fail_callback(Some(|| RAN.store(true, Ordering::SeqCst)));
        run_fail_callback();
        assert!(RAN.load(Ordering::SeqCst));
        set_fail_callback(None);
        run_fail_callback();
    }
}
