//! Worker thread handle with naming and priority control.
//!
//! A thin layer over `std::thread` plus the libc calls std has no opinion on:
//! scheduling priority and reading a thread name back out for
//! profiler/debugger integration.

use std::io;
use std::os::unix::thread::JoinHandleExt;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadPriority {
    Idle,
    Low,
    Normal,
    High,
    Realtime,
}

#[derive(Debug, Default)]
pub struct ThreadConfig {
    pub name: Option<String>,
    /// 0 picks the platform default.
    pub stack_size: usize,
    pub priority: Option<ThreadPriority>,
}

impl ThreadConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn priority(mut self, priority: ThreadPriority) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// A joinable OS thread returning an `i32` exit code.
pub struct Thread {
    handle: Option<JoinHandle<i32>>,
}

impl Thread {
    /// Spawns a thread running `f`.
    ///
    /// # Errors
    ///
    /// Returns the OS error when thread creation fails; callers in this
    /// workspace treat that as fatal.
    pub fn spawn<F>(config: ThreadConfig, f: F) -> io::Result<Self>
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        let mut builder = std::thread::Builder::new();
        if let Some(name) = &config.name {
            builder = builder.name(name.clone());
        }
        if config.stack_size != 0 {
            builder = builder.stack_size(config.stack_size);
        }

        let handle = builder.spawn(f)?;
        let thread = Self {
            handle: Some(handle),
        };
        if let Some(priority) = config.priority {
            thread.set_priority(priority);
        }
        Ok(thread)
    }

    /// True while the thread has not returned from its entry function.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Blocks until the thread exits and returns its exit code.
    ///
    /// # Panics
    ///
    /// Panics if the thread is already joined or exited by panicking.
    pub fn join(&mut self) -> i32 {
        let handle = self.handle.take().expect("thread already joined");
        handle.join().expect("worker thread panicked")
    }

    /// Best-effort priority adjustment; unsupported combinations degrade to
    /// the default scheduling class.
    pub fn set_priority(&self, priority: ThreadPriority) {
        let Some(handle) = self.handle.as_ref() else {
            return;
        };
        set_priority_impl(handle.as_pthread_t(), priority);
    }
}

fn set_priority_impl(thread: libc::pthread_t, priority: ThreadPriority) {
    // Realtime gets a round-robin class; everything else stays SCHED_OTHER
    // where only macOS honors per-thread priorities.
    let (policy, prio) = match priority {
        ThreadPriority::Realtime => (libc::SCHED_RR, 1),
        _ => (libc::SCHED_OTHER, 0),
    };

    // Safety: zero-initialized sched_param is valid for both policies.
    unsafe {
        let mut param: libc::sched_param = core::mem::zeroed();
        param.sched_priority = prio;
        let rc = libc::pthread_setschedparam(thread, policy, &param);
        if rc != 0 {
            tracing::debug!(rc, ?priority, "pthread_setschedparam rejected");
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// Numeric id of the calling thread, unique process-wide while it
        /// runs.
        pub fn current_thread_id() -> u32 {
            // Safety: gettid has no failure modes.
            unsafe { libc::syscall(libc::SYS_gettid) as u32 }
        }

        fn set_name_impl(buf: &[u8; 16]) {
            // Safety: buf is a nul-terminated buffer of at least 16 bytes.
            unsafe { libc::prctl(libc::PR_SET_NAME, buf.as_ptr(), 0, 0, 0) };
        }

        fn get_name_impl(buf: &mut [u8]) {
            // Safety: PR_GET_NAME writes at most 16 bytes including the nul.
            unsafe { libc::prctl(libc::PR_GET_NAME, buf.as_mut_ptr(), 0, 0, 0) };
        }
    } else if #[cfg(target_os = "macos")] {
        /// Numeric id of the calling thread, unique process-wide while it
        /// runs.
        pub fn current_thread_id() -> u32 {
            let mut tid: u64 = 0;
            // Safety: a null pthread asks for the calling thread's id.
            unsafe { libc::pthread_threadid_np(core::ptr::null_mut(), &mut tid) };
            tid as u32
        }

        fn set_name_impl(buf: &[u8; 16]) {
            // Safety: buf is nul-terminated.
            unsafe { libc::pthread_setname_np(buf.as_ptr().cast()) };
        }

        fn get_name_impl(buf: &mut [u8]) {
            // Safety: buffer and length are valid.
            unsafe {
                libc::pthread_getname_np(libc::pthread_self(), buf.as_mut_ptr().cast(), buf.len())
            };
        }
    } else {
        compile_error!("unsupported unix flavor");
    }
}

/// Sets the name of the calling thread as seen by debuggers and profilers.
/// Truncated to the 15 bytes the platforms allow.
pub fn set_current_thread_name(name: &str) {
    let mut buf = [0_u8; 16];
    let n = name.len().min(15);
    buf[..n].copy_from_slice(&name.as_bytes()[..n]);
    set_name_impl(&buf);
}

/// Reads the calling thread's name back.
pub fn current_thread_name() -> String {
    let mut buf = [0_u8; 64];
    get_name_impl(&mut buf);
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..len]).into_owned()
}

pub fn sleep(duration: Duration) {
    std::thread::sleep(duration);
}

pub fn yield_now() {
    std::thread::yield_now();
}

/// Number of logical cores available to this process.
pub fn core_count() -> u32 {
    std::thread::available_parallelism().map_or(1, |n| n.get() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_join_roundtrip() {
        let mut t = Thread::spawn(ThreadConfig::named("TestWorker"), || 42).unwrap();
        assert_eq!(t.join(), 42);
        assert!(!t.is_running());
    }

    #[test]
    fn thread_names_visible() {
        let mut t = Thread::spawn(ThreadConfig::named("NamedThread"), || {
            assert_eq!(current_thread_name(), "NamedThread");
            set_current_thread_name("Renamed");
            assert_eq!(current_thread_name(), "Renamed");
            0
        })
        .unwrap();
        t.join();
    }

    #[test]
    fn thread_ids_differ() {
        let main_id = current_thread_id();
        let mut t = Thread::spawn(ThreadConfig::default(), move || {
            (current_thread_id() != main_id) as i32
        })
        .unwrap();
        assert_eq!(t.join(), 1);
    }
}
