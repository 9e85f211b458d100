//! Thin OS abstraction for the scrap runtime.
//!
//! This crate wraps exactly the platform surface the allocators and the job
//! scheduler need: threads, a recursive mutex, a counting semaphore, a
//! condition-variable signal, virtual memory and a monotonic timer. Anything
//! broader (file I/O, windowing, shell integration) deliberately lives
//! elsewhere.
//!
//! Only unix targets (Linux/macOS) are supported; every platform branch goes
//! through `cfg_if` so a port has one obvious seam per module.

#![cfg(unix)]

pub mod fail;
pub mod mutex;
pub mod semaphore;
pub mod signal;
pub mod spinlock;
pub mod thread;
pub mod time;
pub mod vmem;

pub use fail::{memory_fail, run_fail_callback, set_fail_callback};
pub use mutex::{Mutex, MutexGuard};
pub use semaphore::Semaphore;
pub use signal::Signal;
pub use spinlock::{RawSpinLock, SpinLock};
pub use thread::{Thread, ThreadConfig, ThreadPriority};
pub use vmem::VmFlags;

/// Hardware pause hint for spin loops.
#[inline(always)]
pub fn pause_cpu() {
    core::hint::spin_loop();
}
