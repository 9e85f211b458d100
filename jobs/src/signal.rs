//! Fiber-aware counting condition variable.
//!
//! A [`JobsSignal`] carries an integer `value` and a one-shot `signaled`
//! edge. [`raise`](JobsSignal::raise) sets the edge without touching the
//! value; waiters are released either when their predicate over the value
//! stops holding or when they consume an edge. Each edge releases at most
//! one waiter: fibers are woken by the scheduler's compare-exchange in the
//! waiting-list walk, plain threads consume the edge themselves while
//! spinning.

use crate::tls;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Shared atomic state; fibers waiting on the signal hold a pointer to this,
/// which is why it lives in its own stable allocation.
pub(crate) struct SignalState {
    pub(crate) signaled: AtomicU32,
    pub(crate) value: AtomicI32,
}

pub struct JobsSignal {
    state: Box<SignalState>,
}

impl JobsSignal {
    pub fn new() -> Self {
        Self {
            state: Box::new(SignalState {
                signaled: AtomicU32::new(0),
                value: AtomicI32::new(0),
            }),
        }
    }

    /// Fires the one-shot edge; wakes at most one waiter.
    pub fn raise(&self) {
        self.state.signaled.store(1, Ordering::Release);
    }

    pub fn set(&self, value: i32) {
        self.state.value.store(value, Ordering::Release);
    }

    pub fn increment(&self) {
        self.state.value.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decrement(&self) {
        self.state.value.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn value(&self) -> i32 {
        self.state.value.load(Ordering::Acquire)
    }

    /// Waits while the value is zero (or until a raise). See
    /// [`wait_on_condition`](Self::wait_on_condition).
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.wait_on_condition(|value, reference| value == reference, 0, timeout)
    }

    /// Waits while `pred(value, reference)` holds or until a raise edge is
    /// consumed, whichever comes first.
    ///
    /// From inside a fiber the wait suspends the fiber (the timeout is
    /// ignored; fiber waits are indefinite) and the scheduler requeues it
    /// when another party raises. From a plain thread it spins with yields
    /// and honors the timeout, returning false on expiry.
    pub fn wait_on_condition(
        &self,
        pred: fn(i32, i32) -> bool,
        reference: i32,
        timeout: Option<Duration>,
    ) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut spin = 0_u32;

        loop {
            if !pred(self.state.value.load(Ordering::Acquire), reference) {
                return true;
            }

            if let Some(props) = tls::cur_props() {
                // Fiber path: park on the signal and switch out. The
                // scheduler's CAS consumes the edge that readies us again.
                mem::temp::assert_no_open_scopes();
                // Safety: props is the fiber currently running on this
                // thread; only we touch it until it is back in the list.
                unsafe {
                    let p = props.as_ptr();
                    (*p).owner_tid = tls::thread_id();
                    (*p).signal = Some(NonNull::from(&*self.state));
                    let suspend = (*p).suspend.expect("fiber has no suspend point");
                    suspend.as_ref().suspend();
                    (*p).signal = None;
                }
                return true;
            }

            // Plain thread: consume the edge ourselves.
            if self
                .state
                .signaled
                .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }

            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                return false;
            }

            spin = spin.wrapping_add(1);
            if spin & 1023 != 0 {
                sys::pause_cpu();
            } else {
                sys::thread::yield_now();
            }
        }
    }
}

impl Default for JobsSignal {
    fn default() -> Self {
        Self::new()
    }
}
