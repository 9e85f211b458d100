//! Array-based ticket lock.
//!
//! Each thread spins on its own cache-padded slot instead of a shared word,
//! so handoff under contention is a single store to the next slot rather
//! than a stampede. Sized to the worker count at init; selected for the
//! waiting-list lock by the `anderson-lock` feature.

use collections::CachePadded;
use core::sync::atomic::{AtomicU32, Ordering};

struct Slot {
    locked: CachePadded<AtomicU32>,
    position: u32,
}

pub struct AndersonLock {
    slots: Box<[Slot]>,
    count: u32,
    /// Non-zero when `count` is not a power of two: the ticket counter must
    /// wrap to a multiple of `count` instead of zero.
    wrap: u32,
    mask: u32,
    next: CachePadded<AtomicU32>,
}

pub struct AndersonGuard<'a> {
    lock: &'a AndersonLock,
    slot: u32,
}

impl AndersonLock {
    /// A lock serving up to `num_threads` concurrent entrants.
    pub fn new(num_threads: u32) -> Self {
        assert!(num_threads > 0);
        let slots = (0..num_threads)
            .map(|i| Slot {
                // Every slot but the first starts locked; exiting slot N
                // unlocks slot N+1.
                locked: CachePadded::new(AtomicU32::new(u32::from(i != 0))),
                position: i,
            })
            .collect();

        let wrap = if num_threads.is_power_of_two() {
            0
        } else {
            (u32::MAX % num_threads) + 1
        };

        Self {
            slots,
            count: num_threads,
            wrap,
            mask: num_threads - 1,
            next: CachePadded::new(AtomicU32::new(0)),
        }
    }

    pub fn lock(&self) -> AndersonGuard<'_> {
        let slot = self.enter();
        AndersonGuard { lock: self, slot }
    }

    /// Takes a ticket and spins on the owned slot until the previous holder
    /// hands over. Returns the slot to pass to [`exit`](Self::exit).
    pub fn enter(&self) -> u32 {
        let position = if self.wrap != 0 {
            let mut position = self.next.load(Ordering::Acquire);
            loop {
                let next = if position == u32::MAX {
                    self.wrap
                } else {
                    position + 1
                };
                match self.next.compare_exchange_weak(
                    position,
                    next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(current) => position = current,
                }
            }
            position % self.count
        } else {
            self.next.fetch_add(1, Ordering::AcqRel) & self.mask
        };

        let slot = &self.slots[position as usize];
        while slot.locked.load(Ordering::Acquire) != 0 {
            sys::pause_cpu();
        }
        // Re-arm the slot for the next ticket holder that wraps onto it.
        slot.locked.store(1, Ordering::Relaxed);

        position
    }

    /// Releases the lock taken at `slot`, handing over to the next ticket.
    pub fn exit(&self, slot: u32) {
        let position = if self.wrap == 0 {
            (self.slots[slot as usize].position + 1) & self.mask
        } else {
            (self.slots[slot as usize].position + 1) % self.count
        };
        self.slots[position as usize]
            .locked
            .store(0, Ordering::Release);
    }
}

impl Drop for AndersonGuard<'_> {
    fn drop(&mut self) {
        self.lock.exit(self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn hammer(lock: Arc<AndersonLock>, threads: u32) {
        let counter = Arc::new(std::sync::Mutex::new(0_u64));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..2000 {
                        let _g = lock.lock();
                        // The outer mutex is only a checksum carrier; the
                        // Anderson lock provides the exclusion under test.
                        *counter.try_lock().expect("mutual exclusion violated") += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*counter.lock().unwrap(), u64::from(threads) * 2000);
    }

    #[test]
    fn excludes_with_power_of_two_slots() {
        hammer(Arc::new(AndersonLock::new(4)), 4);
    }

    #[test]
    fn excludes_with_odd_slot_count() {
        hammer(Arc::new(AndersonLock::new(3)), 3);
    }

    #[test]
    fn single_thread_reentry_sequence() {
        let lock = AndersonLock::new(2);
        for _ in 0..10 {
            let g = lock.lock();
            drop(g);
        }
    }
}
