//! Fiber-based job dispatcher.
//!
//! Work is submitted as a *dispatch*: `group_size` invocations of one
//! callback sharing a completion counter. Each invocation runs on a stackful
//! fiber served by a fixed pool of worker threads per task type (short or
//! long). Fibers switch out cooperatively at exactly two points
//! ([`JobSystem::wait_for_completion`] and [`JobsSignal`] waits) and may be
//! resumed on a different worker than the one they last ran on.
//!
//! Dispatch never blocks and never allocates: job instances and fiber
//! descriptors come from fixed lock-free pools, fiber stacks from a private
//! TLSF heap reserved at init. Exhausting any of them is a sizing error and
//! asserts.
//!
//! ```no_run
//! let jobs = jobs::JobSystem::new(jobs::JobsConfig::default());
//!
//! fn work(index: u32, _user: *mut ()) {
//!     let _ = index;
//! }
//! let handle = jobs.dispatch(
//!     jobs::JobsType::ShortTask,
//!     work,
//!     core::ptr::null_mut(),
//!     8,
//!     jobs::JobsPriority::Normal,
//!     0,
//! );
//! jobs.wait_for_completion(handle);
//! ```

mod anderson;
mod signal;
mod stack;
mod tls;
mod waiting_list;

pub use anderson::{AndersonGuard, AndersonLock};
pub use signal::JobsSignal;

use crate::stack::PooledStack;
use crate::waiting_list::{JobsFiberProps, WaitingList};
use collections::{AtomicPool, CachePadded};
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use fiber::{Fiber, Switch};
use mem::{Allocator, TlsfAllocatorTs};
use std::sync::Arc;
use sys::thread::{ThreadConfig, ThreadPriority};

/// A single job: `(index within the dispatch group, user data)`.
pub type JobsCallback = fn(index: u32, user_data: *mut ());

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobsType {
    /// Served by the short-task pool; for work measured in microseconds.
    ShortTask = 0,
    /// Served by the long-task pool; for work that may block on children.
    LongTask = 1,
}

impl JobsType {
    pub(crate) const COUNT: usize = 2;

    #[inline]
    fn index(self) -> usize {
        self as usize
    }

    fn name(self) -> &'static str {
        match self {
            JobsType::ShortTask => "ShortTask",
            JobsType::LongTask => "LongTask",
        }
    }
}

/// Queues are FIFO within a priority and strictly preferred by priority at
/// pick time; a running fiber is never preempted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum JobsPriority {
    High = 0,
    #[default]
    Normal = 1,
    Low = 2,
}

impl JobsPriority {
    pub(crate) const COUNT: usize = 3;
}

/// Compile-time pool sizes; dispatch latency must not include an allocator
/// call, so these do not grow.
pub const MAX_JOB_INSTANCES: usize = 1024;
pub const MAX_PENDING_FIBERS: usize = MAX_JOB_INSTANCES * 4;

pub const DEFAULT_MAX_FIBERS: u32 = 128;
const SHORT_TASK_STACK_SIZE: u32 = 256 * 1024;
const LONG_TASK_STACK_SIZE: u32 = 512 * 1024;
/// Fiber-stack heap budget per fiber slot.
const FIBER_HEAP_PER_FIBER: usize = 2 * 1024 * 1024;
const WORKER_STACK_SIZE: usize = 256 * 1024;

#[derive(Clone, Copy)]
pub struct JobsConfig {
    /// 0 picks `core_count - 1`.
    pub num_short_task_threads: u32,
    /// 0 picks `core_count - 1`.
    pub num_long_task_threads: u32,
    /// Upper bound on concurrently live fibers; sizes the stack heap.
    pub max_fibers: u32,
    /// Record every live fiber-heap allocation for leak reports.
    pub debug_allocations: bool,
    pub capture_stacktrace_for_temp_allocator: bool,
    pub capture_stacktrace_for_fiber_protector: bool,
    /// Backing allocator for pools and the fiber-stack heap.
    pub alloc: &'static (dyn Allocator + Sync),
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            num_short_task_threads: 0,
            num_long_task_threads: 0,
            max_fibers: DEFAULT_MAX_FIBERS,
            debug_allocations: false,
            capture_stacktrace_for_temp_allocator: false,
            capture_stacktrace_for_fiber_protector: false,
            alloc: mem::default_alloc(),
        }
    }
}

/// Completion state of one dispatch.
pub(crate) struct JobsInstance {
    /// Number of group members still running; the instance is done at zero.
    pub(crate) counter: CachePadded<AtomicU32>,
    pub(crate) jtype: JobsType,
    /// Auto-delete instances return to their pool when the counter hits
    /// zero; nobody may wait on them.
    pub(crate) auto_delete: bool,
}

/// Handle for a dispatch; waiting on it is mandatory (auto-delete dispatches
/// return no handle).
#[must_use = "a dispatch handle must be passed to wait_for_completion"]
pub struct JobsHandle {
    instance: NonNull<JobsInstance>,
}

// Safety: the instance lives in the scheduler's pool; the handle only
// carries the completion counter across threads.
unsafe impl Send for JobsHandle {}

/// High-water marks captured since the last [`JobSystem::reset_budget_stats`].
#[derive(Clone, Copy, Debug, Default)]
pub struct JobsBudgetStats {
    pub max_short_task_threads: u32,
    pub max_long_task_threads: u32,
    pub num_busy_short_threads: u32,
    pub num_busy_long_threads: u32,
    pub max_fibers: u32,
    pub num_fibers: u32,
    pub max_jobs: u32,
    pub num_jobs: u32,
    pub fiber_heap_size: usize,
    pub fiber_heap_max: usize,
}

#[derive(Clone, Copy, Default)]
struct HighWater {
    busy_threads: [u32; JobsType::COUNT],
    fibers: u32,
    instances: u32,
    fiber_heap: usize,
}

struct Stats {
    busy_threads: [AtomicU32; JobsType::COUNT],
    num_fibers: AtomicU32,
    num_instances: AtomicU32,
    // Running maxima, copied into `present` by reset_budget_stats.
    max_busy_threads: [AtomicU32; JobsType::COUNT],
    max_fibers: AtomicU32,
    max_instances: AtomicU32,
    max_fiber_heap: AtomicUsize,
    present: spin::Mutex<HighWater>,
}

impl Stats {
    fn new() -> Self {
        Self {
            busy_threads: [AtomicU32::new(0), AtomicU32::new(0)],
            num_fibers: AtomicU32::new(0),
            num_instances: AtomicU32::new(0),
            max_busy_threads: [AtomicU32::new(0), AtomicU32::new(0)],
            max_fibers: AtomicU32::new(0),
            max_instances: AtomicU32::new(0),
            max_fiber_heap: AtomicUsize::new(0),
            present: spin::Mutex::new(HighWater::default()),
        }
    }

    fn bump_busy(&self, ti: usize) {
        let now = self.busy_threads[ti].fetch_add(1, Ordering::Relaxed) + 1;
        self.max_busy_threads[ti].fetch_max(now, Ordering::Relaxed);
    }

    fn bump_fibers(&self) {
        let now = self.num_fibers.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_fibers.fetch_max(now, Ordering::Relaxed);
    }

    fn bump_instances(&self) {
        let now = self.num_instances.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_instances.fetch_max(now, Ordering::Relaxed);
    }

    fn reset(&self) {
        let snapshot = HighWater {
            busy_threads: [
                self.max_busy_threads[0].swap(0, Ordering::Relaxed),
                self.max_busy_threads[1].swap(0, Ordering::Relaxed),
            ],
            fibers: self.max_fibers.swap(0, Ordering::Relaxed),
            instances: self.max_instances.swap(0, Ordering::Relaxed),
            fiber_heap: self.max_fiber_heap.swap(0, Ordering::Relaxed),
        };
        *self.present.lock() = snapshot;
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "anderson-lock")] {
        struct ListLock {
            inner: AndersonLock,
        }

        impl ListLock {
            fn new(num_threads: u32) -> Self {
                Self { inner: AndersonLock::new(num_threads) }
            }

            fn with<R>(&self, f: impl FnOnce() -> R) -> R {
                let _guard = self.inner.lock();
                f()
            }
        }
    } else {
        struct ListLock {
            inner: sys::Mutex,
        }

        impl ListLock {
            fn new(_num_threads: u32) -> Self {
                Self { inner: sys::Mutex::default() }
            }

            fn with<R>(&self, f: impl FnOnce() -> R) -> R {
                let _guard = self.inner.lock();
                f()
            }
        }
    }
}

/// Everything the workers share; owned by an `Arc` so shutdown can tear the
/// [`JobSystem`] handle down while workers drain.
struct Shared {
    num_threads: [u32; JobsType::COUNT],
    max_fibers: u32,
    semaphores: [sys::Semaphore; JobsType::COUNT],
    lock: ListLock,
    /// One waiting list per task type; only touched through
    /// [`Shared::with_waiting`].
    waiting: UnsafeCell<[WaitingList; JobsType::COUNT]>,
    instance_pool: AtomicPool<'static, JobsInstance, MAX_JOB_INSTANCES>,
    props_pool: AtomicPool<'static, JobsFiberProps, MAX_PENDING_FIBERS>,
    /// Fiber stacks; spinlocked because fibers die concurrently.
    stack_heap: TlsfAllocatorTs,
    stack_heap_buffer: NonNull<u8>,
    fiber_heap_total: usize,
    alloc: &'static (dyn Allocator + Sync),
    debug_allocations: bool,
    quit: AtomicBool,
    stats: Stats,
}

// Safety: the waiting lists are guarded by `lock`; pools and heaps are
// internally synchronized; raw pointers are into pool-stable storage.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

/// Closure capture for the fiber entry; props addresses are pool-stable and
/// the descriptor travels between threads only while its fiber is suspended.
#[derive(Clone, Copy)]
struct PropsPtr(NonNull<JobsFiberProps>);
// Safety: see above.
unsafe impl Send for PropsPtr {}

impl Shared {
    fn with_waiting<R>(&self, f: impl FnOnce(&mut [WaitingList; JobsType::COUNT]) -> R) -> R {
        self.lock.with(|| {
            // Safety: the list lock is held.
            f(unsafe { &mut *self.waiting.get() })
        })
    }

    fn dispatch_internal(
        &self,
        auto_delete: bool,
        jtype: JobsType,
        callback: JobsCallback,
        user_data: *mut (),
        group_size: u32,
        priority: JobsPriority,
        stack_size: u32,
    ) -> NonNull<JobsInstance> {
        assert!(group_size > 0, "dispatch needs at least one job");

        let instance_ptr = self.instance_pool.alloc();
        // Safety: fresh pool slot, exclusively ours until published below.
        unsafe {
            instance_ptr.as_ptr().write(JobsInstance {
                counter: CachePadded::new(AtomicU32::new(group_size)),
                jtype,
                auto_delete,
            });
        }
        self.stats.bump_instances();

        let stack_size = if stack_size != 0 {
            stack_size
        } else {
            match jtype {
                JobsType::ShortTask => SHORT_TASK_STACK_SIZE,
                JobsType::LongTask => LONG_TASK_STACK_SIZE,
            }
        };

        // Publish the group at the tail of its priority queue.
        self.with_waiting(|lists| {
            for index in 0..group_size {
                let props_ptr = self.props_pool.alloc();
                // Safety: fresh pool slot.
                unsafe {
                    props_ptr.as_ptr().write(JobsFiberProps::new(
                        callback, user_data, instance_ptr, priority, index, stack_size,
                    ));
                }
                lists[jtype.index()].add(props_ptr);
            }
        });

        self.semaphores[jtype.index()].post(group_size);
        instance_ptr
    }

    /// Runs an unlinked, ready fiber descriptor on the calling worker.
    ///
    /// The descriptor is touched through raw accesses only: while the fiber
    /// runs, the wait entry points mutate it through their own pointers, so
    /// no `&mut` may span the switch.
    fn run_picked(&self, props_ptr: NonNull<JobsFiberProps>, jtype: JobsType) {
        let props = props_ptr.as_ptr();
        let ti = jtype.index();

        // Safety: an unlinked descriptor is exclusively this worker's.
        unsafe {
            if (*props).fiber.is_none() {
                // First pick: create the fiber. The stack heap outlives
                // every fiber because workers are joined before teardown.
                let stack = PooledStack::new(&self.stack_heap, (*props).stack_size as usize);
                let capture = PropsPtr(props_ptr);
                (*props).fiber = Some(Fiber::new(stack, move |suspend| {
                    let capture = capture;
                    let props = capture.0.as_ptr();
                    // Safety: the descriptor outlives its fiber; the suspend
                    // slot's address is stable for the fiber's lifetime.
                    unsafe {
                        (*props).suspend = Some(NonNull::from(suspend));
                        ((*props).callback)((*props).index, (*props).user_data);
                    }
                }));
                self.stats.bump_fibers();
                self.stats
                    .max_fiber_heap
                    .fetch_max(self.stack_heap.allocated_size(), Ordering::Relaxed);
            }

            (*props).owner_tid = 0;
        }

        tls::set_cur_props(Some(props_ptr));
        self.stats.bump_busy(ti);

        // Safety: the fiber exists (created above) and only this worker
        // resumes it.
        let switch = unsafe {
            (*props)
                .fiber
                .as_mut()
                .expect("fiber just created")
                .resume()
        };

        tls::set_cur_props(None);
        self.stats.busy_threads[ti].fetch_sub(1, Ordering::Relaxed);

        // Safety: still exclusively ours until requeued or released.
        let instance_ptr = unsafe { (*props).instance };
        match switch {
            Switch::Finished => {
                // Safety: as above; clearing `fiber` returns its stack to
                // the heap.
                unsafe {
                    debug_assert!((*props).prev.is_none() && (*props).next.is_none());
                    (*props).fiber = None;
                    (*props).suspend = None;
                }
                self.stats.num_fibers.fetch_sub(1, Ordering::Relaxed);
                self.props_pool.dealloc(props_ptr);

                // Safety: the instance outlives all of its group's fibers.
                let instance = unsafe { instance_ptr.as_ref() };
                // Read before the decrement: once the counter hits zero a
                // waiter may free and recycle the instance under us.
                let auto_delete = instance.auto_delete;
                if instance.counter.fetch_sub(1, Ordering::AcqRel) == 1 && auto_delete {
                    self.instance_pool.dealloc(instance_ptr);
                    self.stats.num_instances.fetch_sub(1, Ordering::Relaxed);
                }
            }
            Switch::Yielded => {
                // Out of wait_for_completion or a signal wait: wire up the
                // dependency recorded in TLS and requeue.
                // Safety: suspended fiber's descriptor is still ours.
                unsafe {
                    (*props).child_counter = tls::take_wait_instance().map(|inst| {
                        // The waiting fiber keeps the instance alive.
                        NonNull::from(&inst.as_ref().counter.0)
                    });
                }
                let ti = unsafe { instance_ptr.as_ref() }.jtype.index();
                self.with_waiting(|lists| lists[ti].add(props_ptr));
                self.semaphores[ti].post(1);
            }
        }
    }
}

fn worker_entry(shared: Arc<Shared>, jtype: JobsType, thread_index: u32) -> i32 {
    tls::init_worker(jtype, thread_index);
    let ti = jtype.index();
    let mut spin = 0_u32;

    while !shared.quit.load(Ordering::Acquire) {
        shared.semaphores[ti].wait(None);

        let (picked, list_live) = shared.with_waiting(|lists| lists[ti].pop_ready());

        if let Some(props) = picked {
            shared.run_picked(props, jtype);
        } else if list_live {
            // Entries exist but none were ready; hand the permit back and
            // back off so the readiness conditions can change.
            shared.semaphores[ti].post(1);
            spin = spin.wrapping_add(1);
            if spin & 1023 != 0 {
                sys::pause_cpu();
            } else {
                sys::thread::yield_now();
            }
        }
    }
    0
}

pub struct JobSystem {
    shared: Arc<Shared>,
    threads: Vec<sys::Thread>,
}

impl JobSystem {
    /// Spawns both worker pools and reserves the fiber-stack heap.
    pub fn new(config: JobsConfig) -> Self {
        let default_threads = sys::thread::core_count().saturating_sub(1).max(1);
        let num_threads = [
            if config.num_short_task_threads == 0 {
                default_threads
            } else {
                config.num_short_task_threads
            },
            if config.num_long_task_threads == 0 {
                default_threads
            } else {
                config.num_long_task_threads
            },
        ];
        let max_fibers = if config.max_fibers == 0 {
            DEFAULT_MAX_FIBERS
        } else {
            config.max_fibers
        };

        // Hook the temp-allocator protector up to our fiber probe.
        mem::temp::register_fiber_check(tls::is_in_fiber);
        mem::temp::set_capture_stacktrace(
            config.capture_stacktrace_for_temp_allocator
                || config.capture_stacktrace_for_fiber_protector,
        );

        let fiber_heap_total = FIBER_HEAP_PER_FIBER * max_fibers as usize;
        let heap_bytes = TlsfAllocatorTs::memory_requirement(fiber_heap_total);
        let heap_buffer = mem::alloc_or_fail(config.alloc, heap_bytes, mem::MACHINE_ALIGN);
        // Safety: buffer sized by memory_requirement; freed in Shared::drop
        // after every worker has been joined.
        let stack_heap = unsafe {
            TlsfAllocatorTs::new(
                fiber_heap_total,
                heap_buffer,
                heap_bytes,
                config.debug_allocations,
            )
        };

        let shared = Arc::new(Shared {
            num_threads,
            max_fibers,
            semaphores: [sys::Semaphore::new(), sys::Semaphore::new()],
            lock: ListLock::new(num_threads[0] + num_threads[1] + 1),
            waiting: UnsafeCell::new([WaitingList::new(), WaitingList::new()]),
            instance_pool: AtomicPool::new(config.alloc),
            props_pool: AtomicPool::new(config.alloc),
            stack_heap,
            stack_heap_buffer: heap_buffer,
            fiber_heap_total,
            alloc: config.alloc,
            debug_allocations: config.debug_allocations,
            quit: AtomicBool::new(false),
            stats: Stats::new(),
        });

        let mut threads = Vec::with_capacity((num_threads[0] + num_threads[1]) as usize);
        for jtype in [JobsType::LongTask, JobsType::ShortTask] {
            let priority = match jtype {
                JobsType::ShortTask => ThreadPriority::High,
                JobsType::LongTask => ThreadPriority::Normal,
            };
            for i in 0..num_threads[jtype.index()] {
                let shared = Arc::clone(&shared);
                let thread = sys::Thread::spawn(
                    ThreadConfig::named(format!("{}_{}", jtype.name(), i + 1))
                        .stack_size(WORKER_STACK_SIZE)
                        .priority(priority),
                    move || worker_entry(shared, jtype, i + 1),
                )
                .expect("failed to spawn worker thread");
                threads.push(thread);
            }
        }

        tracing::info!(
            short_task_threads = num_threads[0],
            long_task_threads = num_threads[1],
            max_fibers,
            "job dispatcher started"
        );

        Self { shared, threads }
    }

    /// Submits `group_size` jobs and returns the handle to wait on.
    /// Never blocks; pool exhaustion asserts.
    pub fn dispatch(
        &self,
        jtype: JobsType,
        callback: JobsCallback,
        user_data: *mut (),
        group_size: u32,
        priority: JobsPriority,
        stack_size: u32,
    ) -> JobsHandle {
        let instance = self.shared.dispatch_internal(
            false, jtype, callback, user_data, group_size, priority, stack_size,
        );
        JobsHandle { instance }
    }

    /// Fire-and-forget dispatch: the instance frees itself when the last
    /// group member completes, so there is nothing to wait on.
    pub fn dispatch_auto(
        &self,
        jtype: JobsType,
        callback: JobsCallback,
        user_data: *mut (),
        group_size: u32,
        priority: JobsPriority,
        stack_size: u32,
    ) {
        let _ = self.shared.dispatch_internal(
            true, jtype, callback, user_data, group_size, priority, stack_size,
        );
    }

    /// Blocks until every job of the dispatch has completed, then frees the
    /// instance. From inside a fiber this suspends the fiber; from a plain
    /// thread it spins with yields.
    pub fn wait_for_completion(&self, handle: JobsHandle) {
        let instance_ptr = handle.instance;
        // Safety: a handle proves the instance is live; non-auto instances
        // are only freed here.
        let instance = unsafe { instance_ptr.as_ref() };
        assert!(
            !instance.auto_delete,
            "wait_for_completion on an auto-delete dispatch"
        );

        let mut spin = 0_u32;
        while instance.counter.load(Ordering::Acquire) != 0 {
            if let Some(props_ptr) = tls::cur_props() {
                // Fiber path: record the dependency and switch out; the
                // worker loop links the child counter and requeues us.
                mem::temp::assert_no_open_scopes();
                // Safety: props of the fiber running on this thread.
                unsafe {
                    let props = props_ptr.as_ptr();
                    (*props).owner_tid = tls::thread_id();
                    tls::set_wait_instance(Some(instance_ptr));
                    let suspend = (*props).suspend.expect("fiber has no suspend point");
                    suspend.as_ref().suspend();
                }
            } else {
                spin = spin.wrapping_add(1);
                if spin & 1023 != 0 {
                    sys::pause_cpu();
                } else {
                    sys::thread::yield_now();
                }
            }
        }

        self.shared.instance_pool.dealloc(instance_ptr);
        self.shared
            .stats
            .num_instances
            .fetch_sub(1, Ordering::Relaxed);
    }

    /// Whether any job of the dispatch is still pending or running.
    pub fn is_running(&self, handle: &JobsHandle) -> bool {
        // Safety: the handle keeps the instance live.
        unsafe { handle.instance.as_ref() }
            .counter
            .load(Ordering::Acquire)
            != 0
    }

    pub fn num_worker_threads(&self, jtype: JobsType) -> u32 {
        self.shared.num_threads[jtype.index()]
    }

    /// High-water marks as of the last [`reset_budget_stats`](Self::reset_budget_stats).
    pub fn budget_stats(&self) -> JobsBudgetStats {
        let present = *self.shared.stats.present.lock();
        JobsBudgetStats {
            max_short_task_threads: self.shared.num_threads[JobsType::ShortTask.index()],
            max_long_task_threads: self.shared.num_threads[JobsType::LongTask.index()],
            num_busy_short_threads: present.busy_threads[JobsType::ShortTask.index()],
            num_busy_long_threads: present.busy_threads[JobsType::LongTask.index()],
            max_fibers: self.shared.max_fibers,
            num_fibers: present.fibers,
            max_jobs: MAX_JOB_INSTANCES as u32,
            num_jobs: present.instances,
            fiber_heap_size: present.fiber_heap,
            fiber_heap_max: self.shared.fiber_heap_total,
        }
    }

    /// Publishes the running maxima into [`budget_stats`](Self::budget_stats)
    /// and starts a fresh measurement window.
    pub fn reset_budget_stats(&self) {
        self.shared.stats.reset();
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        self.shared.quit.store(true, Ordering::Release);
        for jtype in [JobsType::ShortTask, JobsType::LongTask] {
            self.shared.semaphores[jtype.index()].post(self.shared.num_threads[jtype.index()]);
        }
        for thread in &mut self.threads {
            thread.join();
        }

        let leaked = self.shared.stats.num_instances.load(Ordering::Relaxed);
        if leaked != 0 {
            tracing::warn!(leaked, "job instances alive at shutdown");
        }
        if self.shared.debug_allocations {
            self.shared.stack_heap.report_leaks();
        }
        tracing::info!("job dispatcher stopped");
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.alloc
            .free(self.stack_heap_buffer.as_ptr(), mem::MACHINE_ALIGN);
    }
}
