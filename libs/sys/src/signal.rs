//! Condition variable paired with an integer value.
//!
//! `wait` blocks until the value becomes non-zero and resets it;
//! `wait_on_condition` blocks while an arbitrary predicate over the value
//! holds and then writes the reference back. The value is only ever touched
//! under the internal mutex. Raising does not modify the value, so producers
//! pair `set`/`increment` with `raise`.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

pub struct Signal {
    value: Mutex<i32>,
    cond: Condvar,
}

impl Signal {
    pub const fn new() -> Self {
        Self {
            value: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Wakes one waiter.
    pub fn raise(&self) {
        self.cond.notify_one();
    }

    /// Wakes every waiter.
    pub fn raise_all(&self) {
        self.cond.notify_all();
    }

    /// Waits for the value to become non-zero, then resets it to zero.
    /// Returns false if the timeout elapsed first.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut value = self.value.lock();
        while *value == 0 {
            match timeout {
                None => self.cond.wait(&mut value),
                Some(t) => {
                    if self.cond.wait_for(&mut value, t).timed_out() && *value == 0 {
                        return false;
                    }
                }
            }
        }
        *value = 0;
        true
    }

    /// Waits while `pred(value, reference)` holds, then stores `reference`.
    /// Returns false if the timeout elapsed while the predicate still held.
    pub fn wait_on_condition(
        &self,
        pred: fn(i32, i32) -> bool,
        reference: i32,
        timeout: Option<Duration>,
    ) -> bool {
        let mut value = self.value.lock();
        while pred(*value, reference) {
            match timeout {
                None => self.cond.wait(&mut value),
                Some(t) => {
                    if self.cond.wait_for(&mut value, t).timed_out() && pred(*value, reference) {
                        return false;
                    }
                }
            }
        }
        *value = reference;
        true
    }

    pub fn set(&self, value: i32) {
        *self.value.lock() = value;
    }

    pub fn increment(&self) {
        *self.value.lock() += 1;
    }

    pub fn decrement(&self) {
        *self.value.lock() -= 1;
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn set_and_raise_releases_wait() {
        let sig = Arc::new(Signal::new());
        let sig2 = Arc::clone(&sig);

        let waiter = thread::spawn(move || sig2.wait(None));

        thread::sleep(Duration::from_millis(20));
        sig.set(1);
        sig.raise();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn wait_resets_value() {
        let sig = Signal::new();
        sig.set(3);
        assert!(sig.wait(Some(Duration::from_millis(10))));
        // Value was consumed; a second wait must time out.
        assert!(!sig.wait(Some(Duration::from_millis(10))));
    }

    #[test]
    fn condition_wait_writes_reference() {
        let sig = Arc::new(Signal::new());
        let sig2 = Arc::clone(&sig);

        let waiter = thread::spawn(move || sig2.wait_on_condition(|v, r| v < r, 4, None));

        for _ in 0..4 {
            thread::sleep(Duration::from_millis(5));
            sig.increment();
            sig.raise();
        }
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn condition_timeout() {
        let sig = Signal::new();
        assert!(!sig.wait_on_condition(|v, _| v == 0, 0, Some(Duration::from_millis(10))));
    }
}
