//! Lock-free fixed-size object pool.
//!
//! A pointer stack with an atomic high-water index: `alloc` pops with a
//! single `fetch_sub`, `dealloc` pushes with a single `fetch_add`. Capacity
//! is a compile-time constant so that handing out a scheduler entity never
//! involves an allocator call; exhaustion is a sizing bug and asserts.
//!
//! Storage slots are stable addresses for the pool's whole lifetime and are
//! handed out uninitialized; the payload type is expected to be plain old
//! data the caller fills in.

use crate::CachePadded;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};
use mem::{Allocator, SingleShotLayout};

pub struct AtomicPool<'a, T, const N: usize> {
    alloc: &'a dyn Allocator,
    block: *mut u8,
    block_align: usize,
    index: CachePadded<AtomicU32>,
    ptrs: *mut *mut T,
    storage: *mut T,
}

// Safety: the freelist is maintained with atomic ops on `index`; slots are
// plain memory handed to exactly one owner at a time.
unsafe impl<T: Send, const N: usize> Send for AtomicPool<'_, T, N> {}
unsafe impl<T: Send, const N: usize> Sync for AtomicPool<'_, T, N> {}

impl<'a, T, const N: usize> AtomicPool<'a, T, N> {
    /// Builds the pool with one single-shot allocation holding the pointer
    /// stack and the storage slots.
    pub fn new(alloc: &'a dyn Allocator) -> Self {
        let mut layout = SingleShotLayout::new();
        let ptrs_off = layout.field::<*mut T>(N);
        let storage_off = layout.field::<T>(N);
        let block = layout.alloc(alloc).as_ptr();

        // Safety: offsets are inside the fresh block.
        let (ptrs, storage) = unsafe {
            (
                block.add(ptrs_off).cast::<*mut T>(),
                block.add(storage_off).cast::<T>(),
            )
        };
        for i in 0..N {
            // Safety: filling the pointer stack; slot addresses never move.
            unsafe { ptrs.add(N - i - 1).write(storage.add(i)) };
        }

        Self {
            alloc,
            block,
            block_align: layout.align(),
            index: CachePadded::new(AtomicU32::new(N as u32)),
            ptrs,
            storage,
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Live objects currently handed out.
    pub fn live(&self) -> u32 {
        N as u32 - self.index.load(Ordering::Relaxed)
    }

    /// Pops a free slot. The slot's contents are whatever the previous owner
    /// left there; the caller initializes it.
    ///
    /// # Panics
    ///
    /// Panics when the pool is exhausted; capacities are chosen so that this
    /// is a configuration error.
    pub fn alloc(&self) -> NonNull<T> {
        let idx = self.index.fetch_sub(1, Ordering::SeqCst);
        assert!(idx != 0, "atomic pool exhausted (capacity {N})");
        // Safety: idx is unique to this caller, so slot idx-1 is ours alone.
        let ptr = unsafe { self.ptrs.add(idx as usize - 1).read() };
        // Safety: the stack only ever holds pointers into storage.
        unsafe { NonNull::new_unchecked(ptr) }
    }

    /// Returns a slot obtained from [`alloc`](Self::alloc).
    ///
    /// # Panics
    ///
    /// Panics on over-release (returning more slots than were taken).
    pub fn dealloc(&self, ptr: NonNull<T>) {
        debug_assert!(self.owns(ptr));
        let idx = self.index.fetch_add(1, Ordering::SeqCst);
        assert!((idx as usize) < N, "atomic pool over-release");
        // Safety: idx is unique to this caller.
        unsafe { self.ptrs.add(idx as usize).write(ptr.as_ptr()) };
    }

    fn owns(&self, ptr: NonNull<T>) -> bool {
        let addr = ptr.as_ptr() as usize;
        let start = self.storage as usize;
        addr >= start && addr < start + N * size_of::<T>()
    }
}

impl<T, const N: usize> Drop for AtomicPool<'_, T, N> {
    fn drop(&mut self) {
        self.alloc.free(self.block, self.block_align);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mem::default_alloc;

    #[test]
    fn alloc_dealloc_restores_state() {
        let pool: AtomicPool<u64, 8> = AtomicPool::new(default_alloc());
        assert_eq!(pool.live(), 0);

        let a = pool.alloc();
        let b = pool.alloc();
        assert_eq!(pool.live(), 2);
        assert_ne!(a, b);

        pool.dealloc(a);
        pool.dealloc(b);
        assert_eq!(pool.live(), 0);

        // The same addresses come back out.
        let c = pool.alloc();
        let d = pool.alloc();
        assert!([a, b].contains(&c));
        assert!([a, b].contains(&d));
        pool.dealloc(c);
        pool.dealloc(d);
    }

    #[test]
    fn drains_to_capacity() {
        let pool: AtomicPool<u32, 4> = AtomicPool::new(default_alloc());
        let ptrs: Vec<_> = (0..4).map(|_| pool.alloc()).collect();
        assert_eq!(pool.live(), 4);

        // All slots are distinct.
        for (i, a) in ptrs.iter().enumerate() {
            for b in &ptrs[i + 1..] {
                assert_ne!(a, b);
            }
        }
        for p in ptrs {
            pool.dealloc(p);
        }
    }

    #[test]
    fn concurrent_churn() {
        use std::sync::Arc;

        let pool: Arc<AtomicPool<[u8; 64], 64>> = Arc::new(AtomicPool::new(default_alloc()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let p = pool.alloc();
                        // Safety: the slot is exclusively ours until dealloc.
                        unsafe { p.as_ptr().write([0x5A; 64]) };
                        pool.dealloc(p);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.live(), 0);
    }
}
