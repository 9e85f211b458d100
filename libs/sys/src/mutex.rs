//! Recursive mutex with a tunable spin-before-block count.
//!
//! Reentrancy is tracked with the address of a thread-local, which is unique
//! and non-zero per live thread. The blocking substrate is `parking_lot`'s
//! raw mutex; the spin prefix covers the short critical sections this
//! workspace uses it for.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::num::NonZeroUsize;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};
use lock_api::RawMutex as _;

pub const DEFAULT_SPIN_COUNT: u32 = 4000;

pub struct Mutex {
    raw: parking_lot::RawMutex,
    owner: AtomicUsize,
    lock_count: UnsafeCell<u32>,
    spin_count: u32,
}

// Safety: owner/lock_count are only written by the thread holding `raw`.
unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a> {
    lock: &'a Mutex,
    // The guard must stay on the locking thread.
    _m: PhantomData<*mut ()>,
}

impl Mutex {
    pub const fn new(spin_count: u32) -> Self {
        Self {
            raw: parking_lot::RawMutex::INIT,
            owner: AtomicUsize::new(0),
            lock_count: UnsafeCell::new(0),
            spin_count,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    pub fn is_owned_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == local_thread_id().get()
    }

    pub fn lock(&self) -> MutexGuard<'_> {
        let local_id = local_thread_id().get();

        if self.owner.load(Ordering::Relaxed) == local_id {
            // Safety: we already hold the raw mutex.
            unsafe { self.increment_lock_count() };
        } else {
            let mut spun = 0;
            loop {
                if self.raw.try_lock() {
                    break;
                }
                if spun >= self.spin_count {
                    self.raw.lock();
                    break;
                }
                spun += 1;
                core::hint::spin_loop();
            }

            self.owner.store(local_id, Ordering::Relaxed);
            // Safety: raw mutex held, no other thread reads lock_count.
            unsafe {
                debug_assert_eq!(*self.lock_count.get(), 0);
                *self.lock_count.get() = 1;
            }
        }

        MutexGuard {
            lock: self,
            _m: PhantomData,
        }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_>> {
        let local_id = local_thread_id().get();

        if self.owner.load(Ordering::Relaxed) == local_id {
            // Safety: we already hold the raw mutex.
            unsafe { self.increment_lock_count() };
        } else if self.raw.try_lock() {
            self.owner.store(local_id, Ordering::Relaxed);
            // Safety: raw mutex held.
            unsafe {
                debug_assert_eq!(*self.lock_count.get(), 0);
                *self.lock_count.get() = 1;
            }
        } else {
            return None;
        }

        Some(MutexGuard {
            lock: self,
            _m: PhantomData,
        })
    }

    unsafe fn increment_lock_count(&self) {
        // Safety: caller holds the raw mutex.
        unsafe {
            *self.lock_count.get() = (*self.lock_count.get())
                .checked_add(1)
                .expect("recursive mutex lock count overflow");
        }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new(DEFAULT_SPIN_COUNT)
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        // Safety: this guard's thread holds the raw mutex.
        unsafe {
            *self.lock.lock_count.get() -= 1;
            if *self.lock.lock_count.get() == 0 {
                self.lock.owner.store(0, Ordering::Relaxed);
                self.lock.raw.unlock();
            }
        }
    }
}

/// The address of a thread-local is unique to the live thread and never zero.
pub(crate) fn local_thread_id() -> NonZeroUsize {
    thread_local!(static ID: u8 = const { 0 });
    ID.with(|id| NonZeroUsize::new(ptr::from_ref(id) as usize))
        .expect("thread id was zero")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn excludes_other_threads() {
        let m = Arc::new(Mutex::default());
        let flag = Arc::new(AtomicUsize::new(0));

        let g = m.lock();
        let m2 = Arc::clone(&m);
        let flag2 = Arc::clone(&flag);
        let child = thread::spawn(move || {
            let _g = m2.lock();
            assert_eq!(flag2.load(Ordering::SeqCst), 1);
        });

        thread::sleep(std::time::Duration::from_millis(20));
        flag.store(1, Ordering::SeqCst);
        drop(g);
        child.join().unwrap();
    }

    #[test]
    fn reentrant_on_same_thread() {
        let m = Mutex::new(100);
        let g1 = m.lock();
        let g2 = m.lock();
        assert!(m.is_owned_by_current_thread());
        drop(g2);
        assert!(m.is_locked());
        drop(g1);
        assert!(!m.is_locked());
    }

    #[test]
    fn try_lock_fails_cross_thread() {
        let m = Arc::new(Mutex::default());
        let _g = m.lock();

        let m2 = Arc::clone(&m);
        thread::spawn(move || {
            assert!(m2.try_lock().is_none());
        })
        .join()
        .unwrap();
    }
}
