//! Internal ticket spinlock for runtime state
//!
//! Guards strand queues, generator frames and channel state. All of
//! those are mutated on their owning strand, so in steady state this
//! lock is uncontended and behaves like a fence; contention only occurs
//! on the brief cross-strand enqueue paths.
//!
//! Ticket-based: acquirers draw a ticket and wait for it to be served,
//! so contended waiters are granted the lock in arrival order, the same
//! FIFO discipline the strands themselves follow. The wait spins with a
//! pause proportional to the caller's distance from the head of the
//! line.
//!
//! Not meant for user code: a generator that wants mutual exclusion
//! should use `CoMutex`, which parks cooperatively instead of spinning.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

/// A FIFO ticket spinlock
pub struct SpinLock<T> {
    next_ticket: AtomicU32,
    now_serving: AtomicU32,
    data: UnsafeCell<T>,
}

// Safety: SpinLock provides exclusive access to T
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create a new spinlock containing the given value
    #[inline]
    pub const fn new(value: T) -> Self {
        SpinLock {
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, waiting for this caller's ticket to be served
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        loop {
            let serving = self.now_serving.load(Ordering::Acquire);
            if serving == ticket {
                return SpinLockGuard { lock: self };
            }
            // Pause longer the further back in line we are; the holder
            // critical sections are short, so the line moves quickly.
            let waiting_behind = ticket.wrapping_sub(serving);
            for _ in 0..waiting_behind {
                core::hint::spin_loop();
            }
        }
    }

    /// Acquire only if nobody holds the lock and nobody is in line
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let serving = self.now_serving.load(Ordering::Acquire);
        // Drawing the ticket and winning it must be one step, otherwise
        // we would be committed to waiting.
        if self
            .next_ticket
            .compare_exchange(
                serving,
                serving.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Check if the lock is held or contended
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.next_ticket.load(Ordering::Relaxed) != self.now_serving.load(Ordering::Relaxed)
    }

    /// Get mutable access through an exclusive reference (no locking)
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        SpinLock::new(T::default())
    }
}

/// Guard that serves the next ticket when dropped
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: We hold the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinLockGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: We hold the lock
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        // Only the holder writes now_serving, so a plain add suffices.
        let serving = self.lock.now_serving.load(Ordering::Relaxed);
        self.lock
            .now_serving
            .store(serving.wrapping_add(1), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_lock_unlock() {
        let lock = SpinLock::new(0u32);
        {
            let mut guard = lock.lock();
            *guard = 7;
        }
        assert_eq!(*lock.lock(), 7);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_try_lock_contended() {
        let lock = SpinLock::new(());

        let guard = lock.try_lock();
        assert!(guard.is_some());
        assert!(lock.is_locked());
        assert!(lock.try_lock().is_none());

        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_concurrent_increments() {
        let lock = Arc::new(SpinLock::new(0u32));
        let mut handles = vec![];

        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    *lock.lock() += 1;
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(*lock.lock(), 4000);
    }

    #[test]
    fn test_ticket_wraparound() {
        let lock = SpinLock::new(0u64);
        // Cycle the counters far enough to cross any small boundary;
        // wrapping arithmetic must keep the line moving.
        for _ in 0..10_000 {
            *lock.lock() += 1;
        }
        assert_eq!(*lock.lock(), 10_000);
        assert!(!lock.is_locked());
    }
}
