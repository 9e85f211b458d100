//! Per-thread scheduler state.
//!
//! Worker threads record what they are currently running here; the dispatch
//! and wait entry points consult it to decide between the fiber path and the
//! plain-thread path. Plain `Cell`s only: nothing in this module may hold a
//! borrow across a fiber switch.

use crate::waiting_list::JobsFiberProps;
use crate::{JobsInstance, JobsType};
use core::cell::Cell;
use core::ptr::NonNull;

struct WorkerTls {
    /// The fiber props currently executing on this thread, if any.
    cur_props: Cell<Option<NonNull<JobsFiberProps>>>,
    /// Set by `wait_for_completion` right before suspending; consumed by the
    /// worker loop to wire up the child counter.
    wait_instance: Cell<Option<NonNull<JobsInstance>>>,
    jtype: Cell<JobsType>,
    thread_index: Cell<u32>,
    thread_id: Cell<u32>,
    is_worker: Cell<bool>,
}

thread_local! {
    static TLS: WorkerTls = const {
        WorkerTls {
            cur_props: Cell::new(None),
            wait_instance: Cell::new(None),
            jtype: Cell::new(JobsType::ShortTask),
            thread_index: Cell::new(0),
            thread_id: Cell::new(0),
            is_worker: Cell::new(false),
        }
    };
}

pub(crate) fn init_worker(jtype: JobsType, thread_index: u32) {
    TLS.with(|t| {
        t.jtype.set(jtype);
        t.thread_index.set(thread_index);
        t.thread_id.set(sys::thread::current_thread_id());
        t.is_worker.set(true);
    });
}

pub(crate) fn cur_props() -> Option<NonNull<JobsFiberProps>> {
    TLS.with(|t| t.cur_props.get())
}

pub(crate) fn set_cur_props(props: Option<NonNull<JobsFiberProps>>) {
    TLS.with(|t| t.cur_props.set(props));
}

pub(crate) fn set_wait_instance(instance: Option<NonNull<JobsInstance>>) {
    TLS.with(|t| t.wait_instance.set(instance));
}

pub(crate) fn take_wait_instance() -> Option<NonNull<JobsInstance>> {
    TLS.with(|t| t.wait_instance.take())
}

pub(crate) fn thread_id() -> u32 {
    TLS.with(|t| t.thread_id.get())
}

/// Probe handed to the temp allocator's fiber protector.
pub(crate) fn is_in_fiber() -> bool {
    cur_props().is_some()
}
