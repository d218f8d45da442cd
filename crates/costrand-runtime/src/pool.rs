//! The reactor pool
//!
//! N OS worker threads drain a shared injector queue of ready
//! callbacks. Strands feed the queue; idle workers park. The pool also
//! owns the timer thread, so timers live and die with the workers.

use crate::config::PoolConfig;
use crate::parking::{Parking, PlatformParking};
use crate::strand::Strand;
use crate::timer::{TimerQueue, TimerThread};

use costrand_core::clog;
use costrand_core::error::RtResult;
use costrand_core::spinlock::SpinLock;
use costrand_core::{cdebug, cerror};

use crossbeam_queue::SegQueue;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A unit of work for the pool
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a reactor pool. Clones share the pool.
#[derive(Clone)]
pub struct IoPool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    /// Shared work queue: strands and timers push, workers pop
    injector: SegQueue<Job>,

    /// Idle-worker parking
    parking: PlatformParking,

    /// Accepting work. Cleared by `shutdown()`.
    live: AtomicBool,

    /// Guards against double shutdown
    shutdown_done: AtomicBool,

    /// Worker join handles
    workers: SpinLock<Vec<JoinHandle<()>>>,

    /// Timer subsystem (thread + queue)
    timer: TimerThread,

    /// Strand id allocator
    next_strand_id: AtomicU64,

    config: PoolConfig,
}

impl IoPool {
    /// Create and start a pool with `workers` threads
    pub fn new(workers: usize) -> RtResult<Self> {
        Self::with_config(PoolConfig::with_workers(workers))
    }

    /// Create and start a pool from a configuration
    pub fn with_config(config: PoolConfig) -> RtResult<Self> {
        config.validate()?;

        let inner = Arc::new(PoolInner {
            injector: SegQueue::new(),
            parking: PlatformParking::new(),
            live: AtomicBool::new(true),
            shutdown_done: AtomicBool::new(false),
            workers: SpinLock::new(Vec::with_capacity(config.workers)),
            timer: TimerThread::new(),
            next_strand_id: AtomicU64::new(1),
            config,
        });

        inner.timer.start();

        {
            let mut handles = inner.workers.lock();
            for i in 0..inner.config.workers {
                let worker_inner = Arc::clone(&inner);
                let handle = thread::Builder::new()
                    .name(format!("costrand-worker-{}", i))
                    .spawn(move || worker_loop(worker_inner, i))
                    .map_err(|_| costrand_core::error::RtError::SpawnFailed)?;
                handles.push(handle);
            }
        }

        Ok(Self { inner })
    }

    /// Enqueue a callback to run on some worker thread
    ///
    /// Posting after `shutdown()` is a programming error.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        assert!(
            self.inner.live.load(Ordering::Acquire),
            "post on a shut-down pool"
        );
        self.inner.injector.push(Box::new(f));
        self.inner.parking.wake_one();
    }

    /// Create a new strand bound to this pool
    pub fn strand(&self) -> Strand {
        let id = self.inner.next_strand_id.fetch_add(1, Ordering::Relaxed);
        Strand::new(self.clone(), id)
    }

    /// The pool's timer queue
    pub fn timer_queue(&self) -> Arc<TimerQueue> {
        self.inner.timer.queue()
    }

    /// Number of worker threads
    pub fn workers(&self) -> usize {
        self.inner.config.workers
    }

    /// Batch limit strands use when draining
    pub(crate) fn batch_limit(&self) -> usize {
        self.inner.config.batch_limit
    }

    /// True until `shutdown()` is called
    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Stop the pool: stop the timer thread, let workers drain the
    /// queue, then join them.
    ///
    /// Must not be called from a worker thread.
    pub fn shutdown(&self) {
        if self.inner.shutdown_done.swap(true, Ordering::SeqCst) {
            return;
        }

        // Timer first, so nothing re-arms work behind the drain.
        self.inner.timer.shutdown();

        self.inner.live.store(false, Ordering::Release);
        self.inner.parking.wake_all();

        let handles = std::mem::take(&mut *self.inner.workers.lock());
        for handle in handles {
            if handle.join().is_err() {
                cerror!("pool worker panicked");
            }
        }
    }
}

/// Main worker loop: drain the injector, park when idle
fn worker_loop(inner: Arc<PoolInner>, id: usize) {
    let _log_ctx = clog::worker_scope(id as u32);
    if inner.config.debug_logging {
        cdebug!("worker {} started", id);
    }

    loop {
        match inner.injector.pop() {
            Some(job) => job(),
            None => {
                // Two-phase sleep: take the wake token first, then
                // re-check shutdown and the queue. Anything published
                // after the token invalidates it, so the park cannot
                // sleep through a wake.
                let token = inner.parking.prepare();
                if !inner.live.load(Ordering::Acquire) {
                    break;
                }
                match inner.injector.pop() {
                    Some(job) => job(),
                    None => {
                        inner
                            .parking
                            .park(token, Some(inner.config.park_timeout));
                    }
                }
            }
        }
    }

    if inner.config.debug_logging {
        cdebug!("worker {} exiting", id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_post_runs_job() {
        let pool = IoPool::new(2).unwrap();
        let (tx, rx) = mpsc::channel();

        pool.post(move || {
            tx.send(42).unwrap();
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        pool.shutdown();
    }

    #[test]
    fn test_many_jobs_all_run() {
        let pool = IoPool::new(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();

        for _ in 0..1000 {
            let counter = Arc::clone(&counter);
            let tx = tx.clone();
            pool.post(move || {
                if counter.fetch_add(1, Ordering::SeqCst) + 1 == 1000 {
                    tx.send(()).unwrap();
                }
            });
        }

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1000);
        pool.shutdown();
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let pool = IoPool::new(1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    #[should_panic(expected = "shut-down pool")]
    fn test_post_after_shutdown_panics() {
        let pool = IoPool::new(1).unwrap();
        pool.shutdown();
        pool.post(|| {});
    }
}
