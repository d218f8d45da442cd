//! Unbounded message buffer
//!
//! The push side never waits: a push appends and immediately completes
//! (unless the buffer is closed). Only poppers park. This is the pipe
//! the select coordinator uses for its private pump.

use crate::chan::{PopKind, PopNode};
use crate::notify::{fire_all, Fired, PlainNotify, PopNotify, StateNotify};

use costrand_core::sign::NotifySign;
use costrand_core::spinlock::SpinLock;
use costrand_core::state::AsyncState;
use costrand_runtime::strand::Strand;
use costrand_runtime::timer::AsyncTimer;

use std::collections::VecDeque;
use std::sync::Arc;

struct MsgState<T> {
    buf: VecDeque<T>,
    pop_wait: VecDeque<PopNode<T>>,
    closed: bool,
    next_node: u64,
}

impl<T> MsgState<T> {
    fn alloc_id(&mut self) -> u64 {
        let id = self.next_node;
        self.next_node += 1;
        id
    }
}

struct MsgInner<T> {
    strand: Strand,
    st: SpinLock<MsgState<T>>,
}

/// Handle to an unbounded message buffer. Clones share the buffer.
pub struct MsgBuffer<T> {
    inner: Arc<MsgInner<T>>,
}

impl<T> Clone for MsgBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> MsgBuffer<T> {
    pub fn new(strand: &Strand) -> Self {
        Self {
            inner: Arc::new(MsgInner {
                strand: strand.clone(),
                st: SpinLock::new(MsgState {
                    buf: VecDeque::new(),
                    pop_wait: VecDeque::new(),
                    closed: false,
                    next_node: 1,
                }),
            }),
        }
    }

    pub fn strand(&self) -> &Strand {
        &self.inner.strand
    }

    /// Append `msg`; always completes `Ok` unless closed
    pub fn push<N>(&self, ntf: N, msg: T)
    where
        N: FnOnce(AsyncState) + Send + 'static,
    {
        let mq = self.clone();
        self.inner
            .strand
            .distribute(move || mq.do_push(msg, Box::new(ntf)));
    }

    pub fn pop<N>(&self, ntf: N)
    where
        N: FnOnce(AsyncState, Option<T>) + Send + 'static,
    {
        let mq = self.clone();
        self.inner
            .strand
            .distribute(move || mq.do_pop(Box::new(ntf)));
    }

    pub fn try_pop<N>(&self, ntf: N)
    where
        N: FnOnce(AsyncState, Option<T>) + Send + 'static,
    {
        let mq = self.clone();
        self.inner
            .strand
            .distribute(move || mq.do_try_pop(Box::new(ntf)));
    }

    pub fn timed_pop<N>(&self, timer: &AsyncTimer, ms: u64, ntf: N)
    where
        N: FnOnce(AsyncState, Option<T>) + Send + 'static,
    {
        debug_assert!(timer.strand() == &self.inner.strand);
        let mq = self.clone();
        let timer = timer.clone();
        self.inner
            .strand
            .distribute(move || mq.do_timed_pop(timer, ms, Box::new(ntf)));
    }

    /// Watch-only readiness registration (see [`Chan::append_pop_notify`](crate::chan::Chan::append_pop_notify))
    pub fn append_pop_notify<N>(&self, ntf: N, sign: &NotifySign)
    where
        N: FnOnce(AsyncState) + Send + 'static,
    {
        let mq = self.clone();
        let sign = sign.clone();
        self.inner
            .strand
            .distribute(move || mq.do_append_pop_notify(Box::new(ntf), sign));
    }

    /// Retract a watch registration
    pub fn remove_pop_notify<N>(&self, ntf: N, sign: &NotifySign)
    where
        N: FnOnce(AsyncState) + Send + 'static,
    {
        let mq = self.clone();
        let sign = sign.clone();
        self.inner
            .strand
            .distribute(move || mq.do_remove_pop_notify(Box::new(ntf), sign));
    }

    pub fn close(&self) {
        let mq = self.clone();
        self.inner.strand.distribute(move || mq.do_close(None));
    }

    pub fn close_with<N>(&self, ntf: N)
    where
        N: FnOnce() + Send + 'static,
    {
        let mq = self.clone();
        self.inner
            .strand
            .distribute(move || mq.do_close(Some(Box::new(ntf))));
    }

    /// Wake pending poppers with `Cancel` without closing
    pub fn cancel(&self) {
        let mq = self.clone();
        self.inner.strand.distribute(move || mq.do_cancel(None));
    }

    pub fn cancel_with<N>(&self, ntf: N)
    where
        N: FnOnce() + Send + 'static,
    {
        let mq = self.clone();
        self.inner
            .strand
            .distribute(move || mq.do_cancel(Some(Box::new(ntf))));
    }

    /// Reopen after close. The wait queue must be empty.
    pub fn reset(&self) {
        let mq = self.clone();
        self.inner.strand.distribute(move || {
            let mut st = mq.inner.st.lock();
            debug_assert!(st.pop_wait.is_empty());
            st.closed = false;
        });
    }

    // ── strand-side implementations ──

    fn do_push(&self, msg: T, ntf: StateNotify) {
        debug_assert!(self.inner.strand.running_in_this_thread());
        let mut out: Vec<Fired<T>> = Vec::new();
        {
            let mut st = self.inner.st.lock();
            if st.closed {
                out.push(Fired::State(ntf, AsyncState::Closed));
            } else {
                st.buf.push_back(msg);
                Self::serve_pop_waiter(&mut st, &mut out);
                out.push(Fired::State(ntf, AsyncState::Ok));
            }
        }
        fire_all(out);
    }

    fn do_pop(&self, ntf: PopNotify<T>) {
        debug_assert!(self.inner.strand.running_in_this_thread());
        let mut out: Vec<Fired<T>> = Vec::new();
        {
            let mut st = self.inner.st.lock();
            if st.closed {
                out.push(Fired::Pop(ntf, AsyncState::Closed, None));
            } else if let Some(msg) = st.buf.pop_front() {
                out.push(Fired::Pop(ntf, AsyncState::Ok, Some(msg)));
            } else {
                let id = st.alloc_id();
                st.pop_wait.push_back(PopNode {
                    id,
                    kind: PopKind::Consume { ntf, timer: None },
                });
            }
        }
        fire_all(out);
    }

    fn do_try_pop(&self, ntf: PopNotify<T>) {
        debug_assert!(self.inner.strand.running_in_this_thread());
        let mut out: Vec<Fired<T>> = Vec::new();
        {
            let mut st = self.inner.st.lock();
            if st.closed {
                out.push(Fired::Pop(ntf, AsyncState::Closed, None));
            } else if let Some(msg) = st.buf.pop_front() {
                out.push(Fired::Pop(ntf, AsyncState::Ok, Some(msg)));
            } else {
                out.push(Fired::Pop(ntf, AsyncState::Fail, None));
            }
        }
        fire_all(out);
    }

    fn do_timed_pop(&self, timer: AsyncTimer, ms: u64, ntf: PopNotify<T>) {
        debug_assert!(self.inner.strand.running_in_this_thread());
        let mut out: Vec<Fired<T>> = Vec::new();
        {
            let mut st = self.inner.st.lock();
            if st.closed {
                out.push(Fired::Pop(ntf, AsyncState::Closed, None));
            } else if let Some(msg) = st.buf.pop_front() {
                out.push(Fired::Pop(ntf, AsyncState::Ok, Some(msg)));
            } else if ms > 0 {
                let id = st.alloc_id();
                st.pop_wait.push_back(PopNode {
                    id,
                    kind: PopKind::Consume {
                        ntf,
                        timer: Some(timer.clone()),
                    },
                });
                let mq = self.clone();
                timer.timeout(ms, move || mq.expire_pop(id));
            } else {
                out.push(Fired::Pop(ntf, AsyncState::Overtime, None));
            }
        }
        fire_all(out);
    }

    fn do_append_pop_notify(&self, ntf: StateNotify, sign: NotifySign) {
        debug_assert!(self.inner.strand.running_in_this_thread());
        debug_assert!(!sign.is_registered(), "watch sign already registered");
        let mut out: Vec<Fired<T>> = Vec::new();
        {
            let mut st = self.inner.st.lock();
            if st.closed {
                out.push(Fired::State(ntf, AsyncState::Closed));
            } else if !st.buf.is_empty() {
                out.push(Fired::State(ntf, AsyncState::Ok));
            } else {
                let id = st.alloc_id();
                sign.set_registered(id);
                st.pop_wait.push_back(PopNode {
                    id,
                    kind: PopKind::Watch { ntf, sign },
                });
            }
        }
        fire_all(out);
    }

    fn do_remove_pop_notify(&self, ntf: StateNotify, sign: NotifySign) {
        debug_assert!(self.inner.strand.running_in_this_thread());
        let mut out: Vec<Fired<T>> = Vec::new();
        {
            let mut st = self.inner.st.lock();
            if st.closed {
                out.push(Fired::State(ntf, AsyncState::Closed));
            } else if let Some(node_id) = sign.take_registered() {
                if let Some(pos) = st.pop_wait.iter().position(|n| n.id == node_id) {
                    st.pop_wait.remove(pos);
                }
                out.push(Fired::State(ntf, AsyncState::Ok));
            } else {
                if !st.buf.is_empty() && !st.pop_wait.is_empty() {
                    Self::serve_pop_waiter(&mut st, &mut out);
                }
                out.push(Fired::State(ntf, AsyncState::Fail));
            }
        }
        fire_all(out);
    }

    fn do_close(&self, ntf: Option<PlainNotify>) {
        debug_assert!(self.inner.strand.running_in_this_thread());
        let mut out: Vec<Fired<T>> = Vec::new();
        {
            let mut st = self.inner.st.lock();
            st.closed = true;
            st.buf.clear();
            Self::drain_pop_waiters(&mut st, AsyncState::Closed, &mut out);
        }
        if let Some(ntf) = ntf {
            out.push(Fired::Plain(ntf));
        }
        fire_all(out);
    }

    fn do_cancel(&self, ntf: Option<PlainNotify>) {
        debug_assert!(self.inner.strand.running_in_this_thread());
        let mut out: Vec<Fired<T>> = Vec::new();
        {
            let mut st = self.inner.st.lock();
            Self::drain_pop_waiters(&mut st, AsyncState::Cancel, &mut out);
        }
        if let Some(ntf) = ntf {
            out.push(Fired::Plain(ntf));
        }
        fire_all(out);
    }

    fn expire_pop(&self, id: u64) {
        debug_assert!(self.inner.strand.running_in_this_thread());
        let mut out: Vec<Fired<T>> = Vec::new();
        {
            let mut st = self.inner.st.lock();
            if let Some(pos) = st.pop_wait.iter().position(|n| n.id == id) {
                let node = st.pop_wait.remove(pos).unwrap();
                match node.kind {
                    PopKind::Consume { ntf, .. } => {
                        out.push(Fired::Pop(ntf, AsyncState::Overtime, None))
                    }
                    PopKind::Watch { ntf, sign } => {
                        sign.take_registered();
                        out.push(Fired::State(ntf, AsyncState::Overtime));
                    }
                }
            }
        }
        fire_all(out);
    }

    fn serve_pop_waiter(st: &mut MsgState<T>, out: &mut Vec<Fired<T>>) {
        if st.buf.is_empty() {
            return;
        }
        let node = match st.pop_wait.pop_front() {
            Some(node) => node,
            None => return,
        };
        match node.kind {
            PopKind::Consume { ntf, timer } => {
                if let Some(t) = &timer {
                    t.cancel();
                }
                let msg = st.buf.pop_front().unwrap();
                out.push(Fired::Pop(ntf, AsyncState::Ok, Some(msg)));
            }
            PopKind::Watch { ntf, sign } => {
                sign.take_registered();
                out.push(Fired::State(ntf, AsyncState::Ok));
            }
        }
    }

    fn drain_pop_waiters(st: &mut MsgState<T>, state: AsyncState, out: &mut Vec<Fired<T>>) {
        while let Some(node) = st.pop_wait.pop_front() {
            match node.kind {
                PopKind::Consume { ntf, timer } => {
                    if let Some(t) = &timer {
                        t.cancel();
                    }
                    out.push(Fired::Pop(ntf, state, None));
                }
                PopKind::Watch { ntf, sign } => {
                    sign.take_registered();
                    out.push(Fired::State(ntf, state));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use costrand_runtime::pool::IoPool;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_push_never_waits() {
        let pool = IoPool::new(2).unwrap();
        let strand = pool.strand();
        let mq: MsgBuffer<i32> = MsgBuffer::new(&strand);
        let (tx, rx) = mpsc::channel();

        for i in 0..100 {
            let tx = tx.clone();
            mq.push(move |st| tx.send(st).unwrap(), i);
        }
        for _ in 0..100 {
            assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap().is_ok());
        }
        pool.shutdown();
    }

    #[test]
    fn test_fifo_delivery() {
        let pool = IoPool::new(2).unwrap();
        let strand = pool.strand();
        let mq: MsgBuffer<i32> = MsgBuffer::new(&strand);
        let (tx, rx) = mpsc::channel();

        for i in 0..10 {
            mq.push(|_| {}, i);
        }
        for _ in 0..10 {
            let tx = tx.clone();
            mq.pop(move |_, v| tx.send(v.unwrap()).unwrap());
        }
        for i in 0..10 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), i);
        }
        pool.shutdown();
    }

    #[test]
    fn test_pop_parks_until_push() {
        let pool = IoPool::new(2).unwrap();
        let strand = pool.strand();
        let mq: MsgBuffer<i32> = MsgBuffer::new(&strand);
        let (tx, rx) = mpsc::channel();

        mq.pop(move |st, v| {
            assert!(st.is_ok());
            tx.send(v.unwrap()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        mq.push(|_| {}, 11);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 11);
        pool.shutdown();
    }

    #[test]
    fn test_close_drops_buffered_data() {
        let pool = IoPool::new(2).unwrap();
        let strand = pool.strand();
        let mq: MsgBuffer<i32> = MsgBuffer::new(&strand);
        let (tx, rx) = mpsc::channel();

        mq.push(|_| {}, 1);
        mq.close();
        mq.pop(move |st, v| tx.send((st, v)).unwrap());

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            (AsyncState::Closed, None)
        );
        pool.shutdown();
    }

    #[test]
    fn test_close_with_notify_order() {
        let pool = IoPool::new(2).unwrap();
        let strand = pool.strand();
        let mq: MsgBuffer<i32> = MsgBuffer::new(&strand);
        let (tx, rx) = mpsc::channel();

        {
            let tx = tx.clone();
            mq.pop(move |st, _| tx.send(("waiter", st)).unwrap());
        }
        mq.close_with(move || tx.send(("closed", AsyncState::Ok)).unwrap());

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            ("waiter", AsyncState::Closed)
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            ("closed", AsyncState::Ok)
        );
        pool.shutdown();
    }

    #[test]
    fn test_timed_pop_overtime() {
        let pool = IoPool::new(2).unwrap();
        let strand = pool.strand();
        let mq: MsgBuffer<i32> = MsgBuffer::new(&strand);
        let timer = AsyncTimer::new(&strand);
        let (tx, rx) = mpsc::channel();

        mq.timed_pop(&timer, 20, move |st, v| tx.send((st, v)).unwrap());
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            (AsyncState::Overtime, None)
        );
        pool.shutdown();
    }
}
