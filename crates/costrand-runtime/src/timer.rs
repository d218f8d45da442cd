//! Timer subsystem
//!
//! A single timer thread sleeps until the earliest deadline in a
//! min-heap and posts due callbacks onto their strands, so timer
//! callbacks run with the strand's exclusivity guarantee.
//!
//! # Complexity
//!
//! - Insert: O(log n)
//! - Cancel: O(1) amortized (lazy: cancelled ids collect in a set and
//!   are skipped when they surface; the set is cleared when the heap
//!   drains)
//! - Expiry: O(k log n) for k due timers

use crate::strand::Strand;

use costrand_core::spinlock::SpinLock;

use std::collections::{BinaryHeap, HashSet};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Identifies one timer registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

struct TimerEntry {
    deadline: Instant,
    id: TimerId,
    strand: Strand,
    cb: Box<dyn FnOnce() + Send + 'static>,
}

/// Wrapper for heap ordering (min-heap by deadline, id breaks ties so
/// equal deadlines fire in registration order)
struct HeapEntry(TimerEntry);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.deadline == other.0.deadline && self.0.id == other.0.id
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match other.0.deadline.cmp(&self.0.deadline) {
            std::cmp::Ordering::Equal => other.0.id.cmp(&self.0.id),
            ord => ord,
        }
    }
}

struct TimerInner {
    heap: BinaryHeap<HeapEntry>,
    cancelled: HashSet<TimerId>,
    next_id: u64,
    shutdown: bool,
}

/// Shared deadline queue, drained by the timer thread
pub struct TimerQueue {
    inner: Mutex<TimerInner>,
    cond: Condvar,
}

impl TimerQueue {
    fn new() -> Self {
        Self {
            inner: Mutex::new(TimerInner {
                heap: BinaryHeap::with_capacity(64),
                cancelled: HashSet::new(),
                next_id: 1,
                shutdown: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Register `cb` to be posted onto `strand` after `delay`
    pub fn schedule<F>(&self, delay: Duration, strand: Strand, cb: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_at(Instant::now() + delay, strand, cb)
    }

    /// Register `cb` to be posted onto `strand` at `deadline`
    pub fn schedule_at<F>(&self, deadline: Instant, strand: Strand, cb: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.inner.lock().unwrap();
        let id = TimerId(inner.next_id);
        inner.next_id += 1;
        inner.heap.push(HeapEntry(TimerEntry {
            deadline,
            id,
            strand,
            cb: Box::new(cb),
        }));
        drop(inner);
        // The new deadline may be earlier than what the thread sleeps on.
        self.cond.notify_one();
        id
    }

    /// Cancel a registration (best-effort: the callback may already have
    /// been posted). Returns false if `id` was already cancelled.
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.cancelled.insert(id)
    }

    /// Number of registrations still in the heap (cancelled ones
    /// subtracted)
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.heap.len().saturating_sub(inner.cancelled.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn signal_shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.shutdown = true;
        drop(inner);
        self.cond.notify_all();
    }

    /// Timer thread body
    fn run(&self) {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.shutdown {
                break;
            }

            let now = Instant::now();
            let mut due: Vec<TimerEntry> = Vec::new();

            while let Some(entry) = inner.heap.peek() {
                if entry.0.deadline > now {
                    break;
                }
                let entry = inner.heap.pop().unwrap().0;
                if inner.cancelled.remove(&entry.id) {
                    continue;
                }
                due.push(entry);
            }

            if inner.heap.is_empty() {
                inner.cancelled.clear();
            }

            if !due.is_empty() {
                drop(inner);
                for entry in due {
                    entry.strand.post(entry.cb);
                }
                inner = self.inner.lock().unwrap();
                continue;
            }

            inner = match inner.heap.peek().map(|e| e.0.deadline) {
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(now);
                    self.cond.wait_timeout(inner, wait).unwrap().0
                }
                None => self.cond.wait(inner).unwrap(),
            };
        }
    }
}

/// Owns the timer thread; started and stopped by the pool
pub(crate) struct TimerThread {
    queue: Arc<TimerQueue>,
    handle: SpinLock<Option<JoinHandle<()>>>,
}

impl TimerThread {
    pub(crate) fn new() -> Self {
        Self {
            queue: Arc::new(TimerQueue::new()),
            handle: SpinLock::new(None),
        }
    }

    pub(crate) fn start(&self) {
        let queue = Arc::clone(&self.queue);
        let handle = std::thread::Builder::new()
            .name("costrand-timer".into())
            .spawn(move || queue.run())
            .expect("failed to spawn timer thread");
        *self.handle.lock() = Some(handle);
    }

    pub(crate) fn queue(&self) -> Arc<TimerQueue> {
        Arc::clone(&self.queue)
    }

    pub(crate) fn shutdown(&self) {
        self.queue.signal_shutdown();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

struct TimerSlot {
    id: Option<TimerId>,
    epoch: u64,
}

/// Strand-bound timer handle with at most one outstanding deadline
///
/// `timeout` replaces any previous registration; `cancel` retracts the
/// current one. The callback runs on the owning strand. Clones share
/// the registration, so a waiter holding a clone can cancel the timer
/// when it completes first.
#[derive(Clone)]
pub struct AsyncTimer {
    strand: Strand,
    slot: Arc<SpinLock<TimerSlot>>,
}

impl AsyncTimer {
    pub fn new(strand: &Strand) -> Self {
        Self {
            strand: strand.clone(),
            slot: Arc::new(SpinLock::new(TimerSlot { id: None, epoch: 0 })),
        }
    }

    /// The strand callbacks fire on
    pub fn strand(&self) -> &Strand {
        &self.strand
    }

    /// Arm the timer: run `f` on the strand after `ms` milliseconds.
    /// Replaces any outstanding registration.
    pub fn timeout<F>(&self, ms: u64, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let epoch = {
            let mut slot = self.slot.lock();
            slot.epoch += 1;
            if let Some(old) = slot.id.take() {
                self.strand.pool().timer_queue().cancel(old);
            }
            slot.epoch
        };

        let slot_ref = Arc::clone(&self.slot);
        let id = self.strand.pool().timer_queue().schedule(
            Duration::from_millis(ms),
            self.strand.clone(),
            move || {
                // A cancel or re-arm may have raced the expiry post.
                let fire = {
                    let mut slot = slot_ref.lock();
                    if slot.epoch == epoch {
                        slot.id = None;
                        true
                    } else {
                        false
                    }
                };
                if fire {
                    f();
                }
            },
        );

        let mut slot = self.slot.lock();
        if slot.epoch == epoch {
            slot.id = Some(id);
        } else {
            self.strand.pool().timer_queue().cancel(id);
        }
    }

    /// Disarm the current registration, if any
    pub fn cancel(&self) {
        let mut slot = self.slot.lock();
        slot.epoch += 1;
        if let Some(id) = slot.id.take() {
            self.strand.pool().timer_queue().cancel(id);
        }
    }
}
