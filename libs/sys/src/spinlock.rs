//! Raw test-and-test-and-set spin lock.
//!
//! Used where the critical section is a handful of pointer writes (thread-safe
//! TLSF, scheduler internals) and parking would cost more than it saves.

use core::sync::atomic::{AtomicBool, Ordering};
use lock_api::GuardSend;

pub struct RawSpinLock {
    lock: AtomicBool,
}

// Safety: compare_exchange acquire/release pairs establish the usual mutex
// happens-before edges.
unsafe impl lock_api::RawMutex for RawSpinLock {
    const INIT: Self = Self {
        lock: AtomicBool::new(false),
    };

    type GuardMarker = GuardSend;

    fn lock(&self) {
        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.is_locked() {
                core::hint::spin_loop();
            }
        }
    }

    fn try_lock(&self) -> bool {
        self.lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.lock.store(false, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
    }
}

pub type SpinLock<T> = lock_api::Mutex<RawSpinLock, T>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn contended_increments() {
        let value = Arc::new(SpinLock::new(0_u32));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let value = Arc::clone(&value);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *value.lock() += 1;
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*value.lock(), 4000);
    }
}
