//! Strand-scoped async mutex
//!
//! A logical lock for generators: contended acquires park in a FIFO
//! queue instead of blocking the worker thread. Unlock hands the lock
//! straight to the queue head without ever flipping `locked` back, so
//! there is no window for barging.

use crate::notify::{fire_all, Fired, PlainNotify, StateNotify};

use costrand_core::spinlock::SpinLock;
use costrand_core::state::AsyncState;
use costrand_runtime::strand::Strand;
use costrand_runtime::timer::AsyncTimer;

use std::collections::VecDeque;
use std::sync::Arc;

struct LockNode {
    id: u64,
    ntf: StateNotify,
    timer: Option<AsyncTimer>,
}

struct MutexState {
    locked: bool,
    wait: VecDeque<LockNode>,
    next_node: u64,
}

struct MutexInner {
    strand: Strand,
    st: SpinLock<MutexState>,
}

/// Handle to an async mutex. Clones share the mutex.
#[derive(Clone)]
pub struct CoMutex {
    inner: Arc<MutexInner>,
}

impl CoMutex {
    pub fn new(strand: &Strand) -> Self {
        Self {
            inner: Arc::new(MutexInner {
                strand: strand.clone(),
                st: SpinLock::new(MutexState {
                    locked: false,
                    wait: VecDeque::new(),
                    next_node: 1,
                }),
            }),
        }
    }

    pub fn strand(&self) -> &Strand {
        &self.inner.strand
    }

    /// Acquire: `ntf` fires `Ok` immediately if unlocked, else when the
    /// lock is handed over
    pub fn lock<N>(&self, ntf: N)
    where
        N: FnOnce(AsyncState) + Send + 'static,
    {
        let mx = self.clone();
        self.inner
            .strand
            .distribute(move || mx.do_lock(Box::new(ntf)));
    }

    /// Acquire without waiting: `Fail` when already locked
    pub fn try_lock<N>(&self, ntf: N)
    where
        N: FnOnce(AsyncState) + Send + 'static,
    {
        let mx = self.clone();
        self.inner
            .strand
            .distribute(move || mx.do_try_lock(Box::new(ntf)));
    }

    /// Acquire with a deadline; `Overtime` if the lock was not handed
    /// over in time
    pub fn timed_lock<N>(&self, timer: &AsyncTimer, ms: u64, ntf: N)
    where
        N: FnOnce(AsyncState) + Send + 'static,
    {
        debug_assert!(timer.strand() == &self.inner.strand);
        let mx = self.clone();
        let timer = timer.clone();
        self.inner
            .strand
            .distribute(move || mx.do_timed_lock(timer, ms, Box::new(ntf)));
    }

    /// Release. The queue head (if any) becomes the owner before `ntf`
    /// fires.
    pub fn unlock<N>(&self, ntf: N)
    where
        N: FnOnce() + Send + 'static,
    {
        let mx = self.clone();
        self.inner
            .strand
            .distribute(move || mx.do_unlock(Some(Box::new(ntf))));
    }

    /// Release without a completion notify
    pub fn unlock_plain(&self) {
        let mx = self.clone();
        self.inner.strand.distribute(move || mx.do_unlock(None));
    }

    // ── strand-side implementations ──

    fn do_lock(&self, ntf: StateNotify) {
        debug_assert!(self.inner.strand.running_in_this_thread());
        let mut out: Vec<Fired<()>> = Vec::new();
        {
            let mut st = self.inner.st.lock();
            if st.locked {
                let id = st.next_node;
                st.next_node += 1;
                st.wait.push_back(LockNode {
                    id,
                    ntf,
                    timer: None,
                });
            } else {
                st.locked = true;
                out.push(Fired::State(ntf, AsyncState::Ok));
            }
        }
        fire_all(out);
    }

    fn do_try_lock(&self, ntf: StateNotify) {
        debug_assert!(self.inner.strand.running_in_this_thread());
        let mut out: Vec<Fired<()>> = Vec::new();
        {
            let mut st = self.inner.st.lock();
            if st.locked {
                out.push(Fired::State(ntf, AsyncState::Fail));
            } else {
                st.locked = true;
                out.push(Fired::State(ntf, AsyncState::Ok));
            }
        }
        fire_all(out);
    }

    fn do_timed_lock(&self, timer: AsyncTimer, ms: u64, ntf: StateNotify) {
        debug_assert!(self.inner.strand.running_in_this_thread());
        let mut out: Vec<Fired<()>> = Vec::new();
        {
            let mut st = self.inner.st.lock();
            if st.locked {
                if ms > 0 {
                    let id = st.next_node;
                    st.next_node += 1;
                    st.wait.push_back(LockNode {
                        id,
                        ntf,
                        timer: Some(timer.clone()),
                    });
                    let mx = self.clone();
                    timer.timeout(ms, move || mx.expire_lock(id));
                } else {
                    out.push(Fired::State(ntf, AsyncState::Overtime));
                }
            } else {
                st.locked = true;
                out.push(Fired::State(ntf, AsyncState::Ok));
            }
        }
        fire_all(out);
    }

    fn do_unlock(&self, ntf: Option<PlainNotify>) {
        debug_assert!(self.inner.strand.running_in_this_thread());
        let mut out: Vec<Fired<()>> = Vec::new();
        {
            let mut st = self.inner.st.lock();
            assert!(st.locked, "unlock of an unlocked mutex");
            if let Some(node) = st.wait.pop_front() {
                if let Some(t) = &node.timer {
                    t.cancel();
                }
                // Hand-off: `locked` stays true, the head owns it now.
                out.push(Fired::State(node.ntf, AsyncState::Ok));
            } else {
                st.locked = false;
            }
        }
        if let Some(ntf) = ntf {
            out.push(Fired::Plain(ntf));
        }
        fire_all(out);
    }

    fn expire_lock(&self, id: u64) {
        debug_assert!(self.inner.strand.running_in_this_thread());
        let mut out: Vec<Fired<()>> = Vec::new();
        {
            let mut st = self.inner.st.lock();
            if let Some(pos) = st.wait.iter().position(|n| n.id == id) {
                let node = st.wait.remove(pos).unwrap();
                out.push(Fired::State(node.ntf, AsyncState::Overtime));
            }
        }
        fire_all(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use costrand_runtime::pool::IoPool;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_uncontended_lock_fires_immediately() {
        let pool = IoPool::new(2).unwrap();
        let strand = pool.strand();
        let mx = CoMutex::new(&strand);
        let (tx, rx) = mpsc::channel();

        mx.lock(move |st| tx.send(st).unwrap());
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            AsyncState::Ok
        );
        pool.shutdown();
    }

    #[test]
    fn test_contended_lock_waits_for_handoff() {
        let pool = IoPool::new(2).unwrap();
        let strand = pool.strand();
        let mx = CoMutex::new(&strand);
        let (tx, rx) = mpsc::channel();

        mx.lock(|_| {});
        {
            let tx = tx.clone();
            mx.lock(move |st| tx.send(("second", st)).unwrap());
        }
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        mx.unlock(move || tx.send(("unlocked", AsyncState::Ok)).unwrap());
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            ("second", AsyncState::Ok)
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            ("unlocked", AsyncState::Ok)
        );
        pool.shutdown();
    }

    #[test]
    fn test_fifo_handoff_order() {
        let pool = IoPool::new(2).unwrap();
        let strand = pool.strand();
        let mx = CoMutex::new(&strand);
        let (tx, rx) = mpsc::channel();

        mx.lock(|_| {});
        for i in 0..3 {
            let tx = tx.clone();
            mx.lock(move |_| tx.send(i).unwrap());
        }

        for i in 0..3 {
            mx.unlock_plain();
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), i);
        }
        pool.shutdown();
    }

    #[test]
    fn test_try_lock_fails_when_held() {
        let pool = IoPool::new(2).unwrap();
        let strand = pool.strand();
        let mx = CoMutex::new(&strand);
        let (tx, rx) = mpsc::channel();

        mx.lock(|_| {});
        {
            let tx = tx.clone();
            mx.try_lock(move |st| tx.send(st).unwrap());
        }
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            AsyncState::Fail
        );

        mx.unlock_plain();
        mx.try_lock(move |st| tx.send(st).unwrap());
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            AsyncState::Ok
        );
        pool.shutdown();
    }

    #[test]
    fn test_timed_lock_overtime() {
        let pool = IoPool::new(2).unwrap();
        let strand = pool.strand();
        let mx = CoMutex::new(&strand);
        let timer = AsyncTimer::new(&strand);
        let (tx, rx) = mpsc::channel();

        mx.lock(|_| {});
        mx.timed_lock(&timer, 30, move |st| tx.send(st).unwrap());

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            AsyncState::Overtime
        );

        // The expired waiter must not receive the lock later
        let (htx, hrx) = mpsc::channel();
        mx.unlock_plain();
        mx.try_lock(move |st| htx.send(st).unwrap());
        assert_eq!(
            hrx.recv_timeout(Duration::from_secs(5)).unwrap(),
            AsyncState::Ok
        );
        pool.shutdown();
    }
}
