//! A recursive (reentrant) mutex with an explicit `acquire`/`release` pair
//! rather than an RAII guard.
//!
//! The cache's public `begin_update()`/`end_update()` bracket spans multiple
//! separate API calls (§4.2), so a guard whose lifetime is tied to a single
//! call cannot express it — the same shape as the original's
//! `std::recursive_mutex` plus a `lock_holder` thread-id field. Acquisition
//! backs off with spin-then-yield, mirroring the teacher's
//! `concurrent::hashmap` bucket lock.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: Cell<u64> = Cell::new(0);
}

fn current_thread_id() -> u64 {
    THREAD_ID.with(|cell| {
        let id = cell.get();
        if id != 0 {
            return id;
        }
        let assigned = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        cell.set(assigned);
        assigned
    })
}

struct Backoff {
    step: u32,
    max_step: u32,
}

impl Backoff {
    fn new() -> Self {
        Self { step: 0, max_step: 10 }
    }

    fn spin(&mut self) {
        for _ in 0..(1u32 << self.step.min(self.max_step)) {
            std::hint::spin_loop();
        }
        self.step = self.step.saturating_add(1);
    }

    fn should_yield(&self) -> bool {
        self.step > 6
    }

    fn snooze(&mut self) {
        if self.should_yield() {
            std::thread::yield_now();
        } else {
            self.spin();
        }
    }
}

/// A CAS-based recursive lock. `0` is never a real thread id, so it doubles
/// as the "unheld" sentinel.
pub struct RecursiveLock {
    holder: AtomicU64,
    depth: AtomicUsize,
}

impl RecursiveLock {
    pub fn new() -> Self {
        Self { holder: AtomicU64::new(0), depth: AtomicUsize::new(0) }
    }

    /// Acquire the lock, blocking until available. Reentrant: if the calling
    /// thread already holds it, just bumps the depth counter.
    pub fn acquire(&self) {
        let tid = current_thread_id();
        if self.holder.load(Ordering::Acquire) == tid {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let mut backoff = Backoff::new();
        loop {
            if self.holder.compare_exchange(0, tid, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                self.depth.store(1, Ordering::Relaxed);
                return;
            }
            backoff.snooze();
        }
    }

    /// Release one level of reentrancy. Releasing a lock the current thread
    /// does not hold is a programmer error, not a synchronization conflict,
    /// and panics.
    pub fn release(&self) {
        let tid = current_thread_id();
        assert_eq!(self.holder.load(Ordering::Acquire), tid, "RecursiveLock::release by non-holding thread");
        let depth_after = self.depth.fetch_sub(1, Ordering::Relaxed) - 1;
        if depth_after == 0 {
            self.holder.store(0, Ordering::Release);
        }
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.holder.load(Ordering::Acquire) == current_thread_id()
    }
}

impl Default for RecursiveLock {
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
    fn reentrant_acquire_same_thread() {
        let lock = RecursiveLock::new();
        lock.acquire();
        assert!(lock.is_held_by_current_thread());
        lock.acquire();
        lock.release();
        assert!(lock.is_held_by_current_thread());
        lock.release();
        assert!(!lock.is_held_by_current_thread());
    }

    #[test]
    fn second_thread_blocks_until_release() {
        let lock = Arc::new(RecursiveLock::new());
        lock.acquire();
        let other = Arc::clone(&lock);
        let handle = thread::spawn(move || {
            other.acquire();
            other.release();
        });
        thread::yield_now();
        lock.release();
        handle.join().unwrap();
    }
}
