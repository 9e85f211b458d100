//! Virtual-memory reservation and commit.
//!
//! `reserve` maps address space with no access rights; `commit` backs a range
//! with RAM by flipping protection and advising the kernel. Nothing here
//! tracks ranges: callers own their reservations and must pass matching
//! sizes back to `release`.

use crate::fail::memory_fail;
use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering};

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct VmFlags: u32 {
        /// Hint that the range should be backed by huge pages where the
        /// kernel supports it.
        const HUGE_PAGES = 1 << 0;
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct VmStats {
    pub reserved_bytes: u64,
    pub committed_bytes: u64,
}

static RESERVED: AtomicU64 = AtomicU64::new(0);
static COMMITTED: AtomicU64 = AtomicU64::new(0);

/// Reserves `size` bytes of address space with no backing memory.
pub fn reserve(size: usize, flags: VmFlags) -> *mut u8 {
    // Safety: anonymous private mapping with no file descriptor.
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        memory_fail();
    }

    #[cfg(target_os = "linux")]
    if flags.contains(VmFlags::HUGE_PAGES) {
        // Safety: range was just mapped above.
        unsafe { libc::madvise(ptr, size, libc::MADV_HUGEPAGE) };
    }
    #[cfg(not(target_os = "linux"))]
    let _ = flags;

    RESERVED.fetch_add(size as u64, Ordering::Relaxed);
    ptr.cast()
}

/// Backs `[ptr, ptr+size)` of a reserved range with RAM.
pub fn commit(ptr: *mut u8, size: usize) {
    // Safety: caller passes a subrange of a live reservation.
    let r = unsafe { libc::mprotect(ptr.cast(), size, libc::PROT_READ | libc::PROT_WRITE) };
    assert_eq!(r, 0, "mprotect failed on commit");

    // Safety: same range as above.
    let r = unsafe { libc::madvise(ptr.cast(), size, libc::MADV_WILLNEED) };
    if r != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOMEM) {
            memory_fail();
        }
        tracing::warn!(%err, "madvise(WILLNEED) failed");
    }

    COMMITTED.fetch_add(size as u64, Ordering::Relaxed);
}

/// Returns committed pages to the kernel; the range stays reserved.
pub fn decommit(ptr: *mut u8, size: usize) {
    // Safety: caller passes a committed subrange.
    let r = unsafe { libc::madvise(ptr.cast(), size, libc::MADV_DONTNEED) };
    debug_assert_eq!(r, 0);
    COMMITTED.fetch_sub(size as u64, Ordering::Relaxed);
}

/// Releases an entire reservation.
pub fn release(ptr: *mut u8, size: usize) {
    // Safety: caller passes the base and full size of a reservation.
    let r = unsafe { libc::munmap(ptr.cast(), size) };
    debug_assert_eq!(r, 0);
    RESERVED.fetch_sub(size as u64, Ordering::Relaxed);
}

pub fn page_size() -> usize {
    // Safety: sysconf is always callable.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    debug_assert!(size.is_power_of_two());
    size
}

pub fn stats() -> VmStats {
    VmStats {
        reserved_bytes: RESERVED.load(Ordering::Relaxed),
        committed_bytes: COMMITTED.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_commit_rw_roundtrip() {
        let page = page_size();
        let size = page * 16;
        let base = reserve(size, VmFlags::empty());
        assert!(!base.is_null());

        commit(base, page * 2);
        // Safety: the first two pages are now readable and writable.
        unsafe {
            base.write(0xAB);
            base.add(page * 2 - 1).write(0xCD);
            assert_eq!(base.read(), 0xAB);
        }

        decommit(base, page * 2);
        release(base, size);
    }

    #[test]
    fn stats_track_usage() {
        let page = page_size();
        let base = reserve(page * 4, VmFlags::empty());
        commit(base, page);

        // Our live reservation is a lower bound on the global counters, no
        // matter what other tests do concurrently.
        let during = stats();
        assert!(during.reserved_bytes >= (page * 4) as u64);
        assert!(during.committed_bytes >= page as u64);

        decommit(base, page);
        release(base, page * 4);
    }
}
