//! Pending and suspended fibers, one intrusive list per priority.
//!
//! Props live at stable addresses inside the scheduler's atomic pool, so the
//! lists link them directly through their `prev`/`next` fields: push-tail and
//! unlink-any-node are both O(1). Every operation here happens under the
//! scheduler's waiting-list lock; the only concurrency the walk itself deals
//! with is reading child counters and consuming signal edges, which other
//! threads mutate atomically.

use crate::signal::SignalState;
use crate::stack::PooledStack;
use crate::{JobsCallback, JobsInstance, JobsPriority};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};
use fiber::Fiber;

/// A pending or suspended unit of work, including the lazily-created fiber
/// that runs it.
pub(crate) struct JobsFiberProps {
    pub callback: JobsCallback,
    pub user_data: *mut (),
    pub instance: NonNull<JobsInstance>,
    pub priority: JobsPriority,
    pub index: u32,
    pub stack_size: u32,

    /// Created the first time a worker picks this entry.
    pub fiber: Option<Fiber<PooledStack>>,
    /// Parent-link view into the fiber stack; valid once the fiber ran.
    pub suspend: Option<NonNull<fiber::Suspend>>,
    /// While set, the fiber is unready until the pointed-at counter is zero.
    pub child_counter: Option<NonNull<AtomicU32>>,
    /// While set, the fiber is unready until the signal's edge is consumed.
    pub signal: Option<NonNull<SignalState>>,
    /// Last thread that executed the fiber; a hint only.
    pub owner_tid: u32,

    pub prev: Option<NonNull<JobsFiberProps>>,
    pub next: Option<NonNull<JobsFiberProps>>,
}

impl JobsFiberProps {
    pub(crate) fn new(
        callback: JobsCallback,
        user_data: *mut (),
        instance: NonNull<JobsInstance>,
        priority: JobsPriority,
        index: u32,
        stack_size: u32,
    ) -> Self {
        Self {
            callback,
            user_data,
            instance,
            priority,
            index,
            stack_size,
            fiber: None,
            suspend: None,
            child_counter: None,
            signal: None,
            owner_tid: 0,
            prev: None,
            next: None,
        }
    }

}

/// Three doubly-linked lists, one per priority, with tail pointers.
pub(crate) struct WaitingList {
    head: [Option<NonNull<JobsFiberProps>>; JobsPriority::COUNT],
    tail: [Option<NonNull<JobsFiberProps>>; JobsPriority::COUNT],
}

impl WaitingList {
    pub(crate) const fn new() -> Self {
        Self {
            head: [None; JobsPriority::COUNT],
            tail: [None; JobsPriority::COUNT],
        }
    }

    /// Appends at the tail of the props' priority queue.
    pub(crate) fn add(&mut self, mut props_ptr: NonNull<JobsFiberProps>) {
        // Safety: caller holds the list lock and owns the unlinked props.
        let props = unsafe { props_ptr.as_mut() };
        debug_assert!(props.prev.is_none() && props.next.is_none());
        let index = props.priority as usize;

        props.prev = self.tail[index];
        if let Some(mut tail) = self.tail[index] {
            // Safety: tail is a linked node under the same lock.
            unsafe { tail.as_mut() }.next = Some(props_ptr);
        }
        self.tail[index] = Some(props_ptr);
        if self.head[index].is_none() {
            self.head[index] = Some(props_ptr);
        }
    }

    /// Unlinks a node from wherever it sits in its queue.
    pub(crate) fn remove(&mut self, mut props_ptr: NonNull<JobsFiberProps>) {
        // Safety: caller holds the list lock; the node is linked.
        let props = unsafe { props_ptr.as_mut() };
        let index = props.priority as usize;

        if let Some(mut prev) = props.prev {
            // Safety: linked neighbor under the same lock.
            unsafe { prev.as_mut() }.next = props.next;
        }
        if let Some(mut next) = props.next {
            // Safety: linked neighbor under the same lock.
            unsafe { next.as_mut() }.prev = props.prev;
        }
        if self.head[index] == Some(props_ptr) {
            self.head[index] = props.next;
        }
        if self.tail[index] == Some(props_ptr) {
            self.tail[index] = props.prev;
        }
        props.prev = None;
        props.next = None;
    }

    /// The scheduler's pick: walk priorities high to low and return the
    /// first entry that is ready to run, unlinked. Also reports whether the
    /// list held any entry at all, ready or not.
    ///
    /// An entry is ready when any of these hold:
    /// 1. it has no fiber yet (first run),
    /// 2. its child counter is absent or has reached zero, AND its signal is
    ///    absent or its edge could be consumed (both conditions are
    ///    additive).
    pub(crate) fn pop_ready(&mut self) -> (Option<NonNull<JobsFiberProps>>, bool) {
        let mut any = false;

        for priority in 0..JobsPriority::COUNT {
            let mut cursor = self.head[priority];
            while let Some(props_ptr) = cursor {
                any = true;
                // Safety: linked node under the list lock.
                let props = unsafe { props_ptr.as_ref() };

                let ready = if props.fiber.is_none() {
                    true
                } else {
                    let children_done = props.child_counter.is_none_or(|counter| {
                        // Safety: the counter belongs to a live instance the
                        // waiting fiber keeps alive.
                        unsafe { counter.as_ref() }.load(Ordering::Acquire) == 0
                    });
                    children_done
                        && props.signal.is_none_or(|signal| {
                            // Safety: the signal outlives its waiters by API
                            // contract. The CAS consumes the edge, so each
                            // raise readies exactly one fiber.
                            unsafe { signal.as_ref() }
                                .signaled
                                .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
                                .is_ok()
                        })
                };

                if ready {
                    self.remove(props_ptr);
                    // Safety: now exclusively ours.
                    unsafe { (*props_ptr.as_ptr()).child_counter = None };
                    return (Some(props_ptr), any);
                }

                cursor = props.next;
            }
        }

        (None, any)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        let mut n = 0;
        for priority in 0..JobsPriority::COUNT {
            let mut cursor = self.head[priority];
            while let Some(p) = cursor {
                n += 1;
                // Safety: linked node.
                cursor = unsafe { p.as_ref() }.next;
            }
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JobsType;
    use collections::CachePadded;

    fn dummy_instance() -> NonNull<JobsInstance> {
        NonNull::from(Box::leak(Box::new(JobsInstance {
            counter: CachePadded::new(AtomicU32::new(0)),
            jtype: JobsType::ShortTask,
            auto_delete: false,
        })))
    }

    fn dummy_props(instance: NonNull<JobsInstance>, priority: JobsPriority) -> NonNull<JobsFiberProps> {
        fn nop(_: u32, _: *mut ()) {}
        NonNull::from(Box::leak(Box::new(JobsFiberProps::new(
            nop,
            core::ptr::null_mut(),
            instance,
            priority,
            0,
            4096,
        ))))
    }

    fn free(props: NonNull<JobsFiberProps>) {
        // Safety: created by Box::leak above and unlinked.
        drop(unsafe { Box::from_raw(props.as_ptr()) });
    }

    #[test]
    fn fifo_within_priority() {
        let instance = dummy_instance();
        let mut list = WaitingList::new();
        let a = dummy_props(instance, JobsPriority::Normal);
        let b = dummy_props(instance, JobsPriority::Normal);
        let c = dummy_props(instance, JobsPriority::Normal);
        list.add(a);
        list.add(b);
        list.add(c);
        assert_eq!(list.len(), 3);

        assert_eq!(list.pop_ready().0, Some(a));
        assert_eq!(list.pop_ready().0, Some(b));
        assert_eq!(list.pop_ready().0, Some(c));
        assert_eq!(list.pop_ready(), (None, false));

        free(a);
        free(b);
        free(c);
    }

    #[test]
    fn higher_priority_wins() {
        let instance = dummy_instance();
        let mut list = WaitingList::new();
        let low = dummy_props(instance, JobsPriority::Low);
        let normal = dummy_props(instance, JobsPriority::Normal);
        let high = dummy_props(instance, JobsPriority::High);
        list.add(low);
        list.add(normal);
        list.add(high);

        assert_eq!(list.pop_ready().0, Some(high));
        assert_eq!(list.pop_ready().0, Some(normal));
        assert_eq!(list.pop_ready().0, Some(low));

        free(low);
        free(normal);
        free(high);
    }

    #[test]
    fn unlink_from_middle() {
        let instance = dummy_instance();
        let mut list = WaitingList::new();
        let a = dummy_props(instance, JobsPriority::Normal);
        let b = dummy_props(instance, JobsPriority::Normal);
        let c = dummy_props(instance, JobsPriority::Normal);
        list.add(a);
        list.add(b);
        list.add(c);

        list.remove(b);
        assert_eq!(list.len(), 2);
        assert_eq!(list.pop_ready().0, Some(a));
        assert_eq!(list.pop_ready().0, Some(c));

        free(a);
        free(b);
        free(c);
    }

    #[test]
    fn waiting_entry_is_skipped_but_reported() {
        let instance = dummy_instance();
        let gate = AtomicU32::new(1);

        let mut list = WaitingList::new();
        let blocked = dummy_props(instance, JobsPriority::High);
        // Simulate a suspended fiber waiting on children: mark it started
        // and hang a non-zero counter off it.
        // Safety: exclusive access before linking.
        unsafe {
            let p = blocked.as_ptr();
            (*p).fiber = Some(Fiber::new(
                PooledStack::for_tests(64 * 1024),
                |_suspend| {},
            ));
            (*p).child_counter = Some(NonNull::from(&gate));
        }
        let runnable = dummy_props(instance, JobsPriority::Low);
        list.add(blocked);
        list.add(runnable);

        // The blocked entry is passed over in favor of the lower-priority
        // runnable one, and the walk reports a live list.
        let (picked, any) = list.pop_ready();
        assert_eq!(picked, Some(runnable));
        assert!(any);

        // Children finished: now it is eligible.
        gate.store(0, Ordering::Release);
        let (picked, _) = list.pop_ready();
        assert_eq!(picked, Some(blocked));

        // Safety: run the parked fiber to completion so its drop is clean.
        unsafe {
            let p = blocked.as_ptr();
            assert_eq!((*p).fiber.as_mut().unwrap().resume(), fiber::Switch::Finished);
        }
        free(blocked);
        free(runnable);
    }
}
