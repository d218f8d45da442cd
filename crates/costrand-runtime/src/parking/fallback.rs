//! Portable condvar eventcount
//!
//! Same generation protocol as the futex build, with the word behind a
//! mutex and the sleep on a condvar.

use super::Parking;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct CondvarParking {
    epoch: Mutex<u32>,
    cond: Condvar,
    parked: AtomicUsize,
}

impl CondvarParking {
    pub fn new() -> Self {
        Self {
            epoch: Mutex::new(0),
            cond: Condvar::new(),
            parked: AtomicUsize::new(0),
        }
    }
}

impl Default for CondvarParking {
    fn default() -> Self {
        Self::new()
    }
}

impl Parking for CondvarParking {
    fn prepare(&self) -> u32 {
        *self.epoch.lock().unwrap()
    }

    fn park(&self, token: u32, timeout: Option<Duration>) -> bool {
        let mut epoch = self.epoch.lock().unwrap();
        if *epoch != token {
            return true;
        }

        self.parked.fetch_add(1, Ordering::SeqCst);
        match timeout {
            Some(dur) => {
                let (guard, _timed_out) = self
                    .cond
                    .wait_timeout_while(epoch, dur, |e| *e == token)
                    .unwrap();
                epoch = guard;
            }
            None => {
                epoch = self.cond.wait_while(epoch, |e| *e == token).unwrap();
            }
        }
        self.parked.fetch_sub(1, Ordering::SeqCst);

        *epoch != token
    }

    fn wake_one(&self) {
        let mut epoch = self.epoch.lock().unwrap();
        *epoch = epoch.wrapping_add(1);
        drop(epoch);
        self.cond.notify_one();
    }

    fn wake_all(&self) {
        let mut epoch = self.epoch.lock().unwrap();
        *epoch = epoch.wrapping_add(1);
        drop(epoch);
        self.cond.notify_all();
    }

    fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }
}
