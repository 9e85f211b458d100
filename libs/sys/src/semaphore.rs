//! Counting semaphore with timed waits.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

pub struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    pub const fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Releases `count` permits and wakes that many waiters.
    pub fn post(&self, count: u32) {
        let mut guard = self.count.lock();
        *guard += count;
        for _ in 0..count {
            self.cond.notify_one();
        }
    }

    /// Acquires one permit. `None` waits forever; returns false if the
    /// timeout elapsed without a permit.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut guard = self.count.lock();
        while *guard == 0 {
            match timeout {
                None => self.cond.wait(&mut guard),
                Some(t) => {
                    if self.cond.wait_for(&mut guard, t).timed_out() && *guard == 0 {
                        return false;
                    }
                }
            }
        }
        *guard -= 1;
        true
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}
