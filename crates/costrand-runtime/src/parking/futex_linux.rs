//! Linux futex eventcount
//!
//! The futex word is the wake generation. Sleepers wait while the word
//! still equals their token; wakers bump the word and wake. A bump
//! between token and sleep makes FUTEX_WAIT return EAGAIN at once, so
//! no wake is ever lost and no pending-wake accounting is needed.

use super::Parking;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

pub struct FutexParking {
    /// Wake generation, doubling as the futex word
    epoch: AtomicU32,

    /// Sleeper count, to skip the wake syscall when nobody sleeps
    parked: AtomicUsize,
}

impl FutexParking {
    pub fn new() -> Self {
        Self {
            epoch: AtomicU32::new(0),
            parked: AtomicUsize::new(0),
        }
    }

    fn futex_wait(&self, expected: u32, timeout: Option<Duration>) {
        let timespec = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as i64,
            tv_nsec: d.subsec_nanos() as i64,
        });
        let timespec_ptr = timespec
            .as_ref()
            .map_or(std::ptr::null(), |ts| ts as *const libc::timespec);

        // Sleeps only while the word still equals `expected`.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.epoch.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                expected,
                timespec_ptr,
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }

    fn futex_wake(&self, count: i32) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.epoch.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                count,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }
}

impl Default for FutexParking {
    fn default() -> Self {
        Self::new()
    }
}

impl Parking for FutexParking {
    fn prepare(&self) -> u32 {
        self.epoch.load(Ordering::Acquire)
    }

    fn park(&self, token: u32, timeout: Option<Duration>) -> bool {
        if self.epoch.load(Ordering::Acquire) != token {
            return true;
        }

        self.parked.fetch_add(1, Ordering::SeqCst);
        self.futex_wait(token, timeout);
        self.parked.fetch_sub(1, Ordering::SeqCst);

        self.epoch.load(Ordering::Acquire) != token
    }

    fn wake_one(&self) {
        self.epoch.fetch_add(1, Ordering::Release);
        if self.parked.load(Ordering::SeqCst) > 0 {
            self.futex_wake(1);
        }
    }

    fn wake_all(&self) {
        self.epoch.fetch_add(1, Ordering::Release);
        if self.parked.load(Ordering::SeqCst) > 0 {
            self.futex_wake(i32::MAX);
        }
    }

    fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }
}
