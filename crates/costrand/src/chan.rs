//! Bounded channel
//!
//! Fixed-capacity typed pipe owned by a strand. Every operation first
//! hops onto that strand (inline when already there), so all state is
//! mutated single-threaded and the invariants need no further locking:
//!
//! - a pusher waits only while the buffer is full
//! - a popper waits only while the buffer is empty
//! - both sides are served FIFO
//!
//! A pop that frees a slot promotes exactly one parked pusher into it
//! before the popper's own notify fires. Waiters parked by `timed_*`
//! variants carry their timer and cancel it on any wake.

use crate::notify::{fire_all, Fired, PopNotify, StateNotify};

use costrand_core::sign::NotifySign;
use costrand_core::spinlock::SpinLock;
use costrand_core::state::AsyncState;
use costrand_runtime::strand::Strand;
use costrand_runtime::timer::AsyncTimer;

use std::collections::VecDeque;
use std::sync::Arc;

struct PushNode<T> {
    id: u64,
    msg: T,
    ntf: StateNotify,
    timer: Option<AsyncTimer>,
}

pub(crate) enum PopKind<T> {
    /// Ordinary popper: consumes a value when woken
    Consume {
        ntf: PopNotify<T>,
        timer: Option<AsyncTimer>,
    },

    /// Watch-only waiter registered by `append_pop_notify`: wakes
    /// without consuming data
    Watch { ntf: StateNotify, sign: NotifySign },
}

pub(crate) struct PopNode<T> {
    pub(crate) id: u64,
    pub(crate) kind: PopKind<T>,
}

struct ChanState<T> {
    buf: VecDeque<T>,
    cap: usize,
    push_wait: VecDeque<PushNode<T>>,
    pop_wait: VecDeque<PopNode<T>>,
    closed: bool,
    next_node: u64,
}

impl<T> ChanState<T> {
    fn alloc_id(&mut self) -> u64 {
        let id = self.next_node;
        self.next_node += 1;
        id
    }
}

struct ChanInner<T> {
    strand: Strand,
    st: SpinLock<ChanState<T>>,
}

/// Handle to a bounded channel. Clones share the channel.
pub struct Chan<T> {
    inner: Arc<ChanInner<T>>,
}

impl<T> Clone for Chan<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Chan<T> {
    /// Create a channel with the given capacity on `strand`
    pub fn new(strand: &Strand, cap: usize) -> Self {
        assert!(cap >= 1, "channel capacity must be at least 1");
        Self {
            inner: Arc::new(ChanInner {
                strand: strand.clone(),
                st: SpinLock::new(ChanState {
                    buf: VecDeque::with_capacity(cap),
                    cap,
                    push_wait: VecDeque::new(),
                    pop_wait: VecDeque::new(),
                    closed: false,
                    next_node: 1,
                }),
            }),
        }
    }

    /// The strand all channel state lives on
    pub fn strand(&self) -> &Strand {
        &self.inner.strand
    }

    /// Push `msg`, parking if the buffer is full. `ntf` fires with the
    /// completion state once the value is in the buffer (or the wait
    /// ended another way).
    pub fn push<N>(&self, ntf: N, msg: T)
    where
        N: FnOnce(AsyncState) + Send + 'static,
    {
        let ch = self.clone();
        self.inner
            .strand
            .distribute(move || ch.do_push(msg, Box::new(ntf)));
    }

    /// Push that never parks: fails with `Fail` when the buffer is full
    pub fn try_push<N>(&self, ntf: N, msg: T)
    where
        N: FnOnce(AsyncState) + Send + 'static,
    {
        let ch = self.clone();
        self.inner
            .strand
            .distribute(move || ch.do_try_push(msg, Box::new(ntf)));
    }

    /// Push with a deadline: whichever of the wait and the timer fires
    /// first wins, the other is cancelled
    pub fn timed_push<N>(&self, timer: &AsyncTimer, ms: u64, ntf: N, msg: T)
    where
        N: FnOnce(AsyncState) + Send + 'static,
    {
        debug_assert!(timer.strand() == &self.inner.strand);
        let ch = self.clone();
        let timer = timer.clone();
        self.inner
            .strand
            .distribute(move || ch.do_timed_push(timer, ms, msg, Box::new(ntf)));
    }

    /// Pop a value, parking while the buffer is empty
    pub fn pop<N>(&self, ntf: N)
    where
        N: FnOnce(AsyncState, Option<T>) + Send + 'static,
    {
        let ch = self.clone();
        self.inner
            .strand
            .distribute(move || ch.do_pop(Box::new(ntf)));
    }

    /// Pop that never parks: fails with `Fail` when the buffer is empty
    pub fn try_pop<N>(&self, ntf: N)
    where
        N: FnOnce(AsyncState, Option<T>) + Send + 'static,
    {
        let ch = self.clone();
        self.inner
            .strand
            .distribute(move || ch.do_try_pop(Box::new(ntf)));
    }

    /// Pop with a deadline
    pub fn timed_pop<N>(&self, timer: &AsyncTimer, ms: u64, ntf: N)
    where
        N: FnOnce(AsyncState, Option<T>) + Send + 'static,
    {
        debug_assert!(timer.strand() == &self.inner.strand);
        let ch = self.clone();
        let timer = timer.clone();
        self.inner
            .strand
            .distribute(move || ch.do_timed_pop(timer, ms, Box::new(ntf)));
    }

    /// Register a watch-only readiness notify: fires `Ok` immediately
    /// if data is present, else parks without consuming anything and
    /// records the registration in `sign`.
    pub fn append_pop_notify<N>(&self, ntf: N, sign: &NotifySign)
    where
        N: FnOnce(AsyncState) + Send + 'static,
    {
        let ch = self.clone();
        let sign = sign.clone();
        self.inner
            .strand
            .distribute(move || ch.do_append_pop_notify(Box::new(ntf), sign));
    }

    /// Retract a watch registration. Completes `Ok` if it was still
    /// parked; `Fail` if it had already fired, in which case one other
    /// waiter is woken in compensation when data is available.
    pub fn remove_pop_notify<N>(&self, ntf: N, sign: &NotifySign)
    where
        N: FnOnce(AsyncState) + Send + 'static,
    {
        let ch = self.clone();
        let sign = sign.clone();
        self.inner
            .strand
            .distribute(move || ch.do_remove_pop_notify(Box::new(ntf), sign));
    }

    /// Close the channel: pending waiters wake with `Closed`, and every
    /// later operation completes with `Closed` until `reset`.
    pub fn close(&self) {
        let ch = self.clone();
        self.inner.strand.distribute(move || ch.do_close(None));
    }

    /// Close and fire `ntf` once the close has taken effect
    pub fn close_with<N>(&self, ntf: N)
    where
        N: FnOnce() + Send + 'static,
    {
        let ch = self.clone();
        self.inner
            .strand
            .distribute(move || ch.do_close(Some(Box::new(ntf))));
    }

    /// Wake all pending waiters with `Cancel` without closing
    pub fn cancel(&self) {
        let ch = self.clone();
        self.inner
            .strand
            .distribute(move || ch.do_cancel(true, true, None));
    }

    /// `cancel` with a completion notify
    pub fn cancel_with<N>(&self, ntf: N)
    where
        N: FnOnce() + Send + 'static,
    {
        let ch = self.clone();
        self.inner
            .strand
            .distribute(move || ch.do_cancel(true, true, Some(Box::new(ntf))));
    }

    /// Wake pending pushers with `Cancel`
    pub fn cancel_push(&self) {
        let ch = self.clone();
        self.inner
            .strand
            .distribute(move || ch.do_cancel(true, false, None));
    }

    /// `cancel_push` with a completion notify
    pub fn cancel_push_with<N>(&self, ntf: N)
    where
        N: FnOnce() + Send + 'static,
    {
        let ch = self.clone();
        self.inner
            .strand
            .distribute(move || ch.do_cancel(true, false, Some(Box::new(ntf))));
    }

    /// Wake pending poppers with `Cancel`
    pub fn cancel_pop(&self) {
        let ch = self.clone();
        self.inner
            .strand
            .distribute(move || ch.do_cancel(false, true, None));
    }

    /// `cancel_pop` with a completion notify
    pub fn cancel_pop_with<N>(&self, ntf: N)
    where
        N: FnOnce() + Send + 'static,
    {
        let ch = self.clone();
        self.inner
            .strand
            .distribute(move || ch.do_cancel(false, true, Some(Box::new(ntf))));
    }

    /// Reopen after close/cancel. Wait queues must be empty.
    pub fn reset(&self) {
        let ch = self.clone();
        self.inner.strand.distribute(move || {
            let mut st = ch.inner.st.lock();
            debug_assert!(st.push_wait.is_empty());
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
            } else if st.buf.len() >= st.cap {
                let id = st.alloc_id();
                st.push_wait.push_back(PushNode {
                    id,
                    msg,
                    ntf,
                    timer: None,
                });
            } else {
                debug_assert!(st.push_wait.is_empty());
                st.buf.push_back(msg);
                Self::serve_pop_waiter(&mut st, &mut out);
                out.push(Fired::State(ntf, AsyncState::Ok));
            }
        }
        fire_all(out);
    }

    fn do_try_push(&self, msg: T, ntf: StateNotify) {
        debug_assert!(self.inner.strand.running_in_this_thread());
        let mut out: Vec<Fired<T>> = Vec::new();
        {
            let mut st = self.inner.st.lock();
            if st.closed {
                out.push(Fired::State(ntf, AsyncState::Closed));
            } else if st.buf.len() >= st.cap {
                out.push(Fired::State(ntf, AsyncState::Fail));
            } else {
                debug_assert!(st.push_wait.is_empty());
                st.buf.push_back(msg);
                Self::serve_pop_waiter(&mut st, &mut out);
                out.push(Fired::State(ntf, AsyncState::Ok));
            }
        }
        fire_all(out);
    }

    fn do_timed_push(&self, timer: AsyncTimer, ms: u64, msg: T, ntf: StateNotify) {
        debug_assert!(self.inner.strand.running_in_this_thread());
        let mut out: Vec<Fired<T>> = Vec::new();
        {
            let mut st = self.inner.st.lock();
            if st.closed {
                out.push(Fired::State(ntf, AsyncState::Closed));
            } else if st.buf.len() >= st.cap {
                if ms > 0 {
                    let id = st.alloc_id();
                    st.push_wait.push_back(PushNode {
                        id,
                        msg,
                        ntf,
                        timer: Some(timer.clone()),
                    });
                    let ch = self.clone();
                    timer.timeout(ms, move || ch.expire_push(id));
                } else {
                    out.push(Fired::State(ntf, AsyncState::Overtime));
                }
            } else {
                debug_assert!(st.push_wait.is_empty());
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
                Self::promote_pusher(&mut st, &mut out);
                out.push(Fired::Pop(ntf, AsyncState::Ok, Some(msg)));
            } else {
                debug_assert!(st.push_wait.is_empty());
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
                Self::promote_pusher(&mut st, &mut out);
                out.push(Fired::Pop(ntf, AsyncState::Ok, Some(msg)));
            } else {
                debug_assert!(st.push_wait.is_empty());
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
                Self::promote_pusher(&mut st, &mut out);
                out.push(Fired::Pop(ntf, AsyncState::Ok, Some(msg)));
            } else if ms > 0 {
                debug_assert!(st.push_wait.is_empty());
                let id = st.alloc_id();
                st.pop_wait.push_back(PopNode {
                    id,
                    kind: PopKind::Consume {
                        ntf,
                        timer: Some(timer.clone()),
                    },
                });
                let ch = self.clone();
                timer.timeout(ms, move || ch.expire_pop(id));
            } else {
                debug_assert!(st.push_wait.is_empty());
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
                debug_assert!(st.push_wait.is_empty());
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
                // Already fired: hand the readiness to someone else.
                if !st.buf.is_empty() && !st.pop_wait.is_empty() {
                    Self::serve_pop_waiter(&mut st, &mut out);
                }
                out.push(Fired::State(ntf, AsyncState::Fail));
            }
        }
        fire_all(out);
    }

    fn do_close(&self, ntf: Option<crate::notify::PlainNotify>) {
        debug_assert!(self.inner.strand.running_in_this_thread());
        let mut out: Vec<Fired<T>> = Vec::new();
        {
            let mut st = self.inner.st.lock();
            st.closed = true;
            st.buf.clear();
            while let Some(node) = st.push_wait.pop_front() {
                if let Some(t) = &node.timer {
                    t.cancel();
                }
                out.push(Fired::State(node.ntf, AsyncState::Closed));
            }
            Self::drain_pop_waiters(&mut st, AsyncState::Closed, &mut out);
        }
        if let Some(ntf) = ntf {
            out.push(Fired::Plain(ntf));
        }
        fire_all(out);
    }

    fn do_cancel(&self, push_side: bool, pop_side: bool, ntf: Option<crate::notify::PlainNotify>) {
        debug_assert!(self.inner.strand.running_in_this_thread());
        let mut out: Vec<Fired<T>> = Vec::new();
        {
            let mut st = self.inner.st.lock();
            if push_side {
                while let Some(node) = st.push_wait.pop_front() {
                    if let Some(t) = &node.timer {
                        t.cancel();
                    }
                    out.push(Fired::State(node.ntf, AsyncState::Cancel));
                }
            }
            if pop_side {
                Self::drain_pop_waiters(&mut st, AsyncState::Cancel, &mut out);
            }
        }
        if let Some(ntf) = ntf {
            out.push(Fired::Plain(ntf));
        }
        fire_all(out);
    }

    fn expire_push(&self, id: u64) {
        debug_assert!(self.inner.strand.running_in_this_thread());
        let mut out: Vec<Fired<T>> = Vec::new();
        {
            let mut st = self.inner.st.lock();
            if let Some(pos) = st.push_wait.iter().position(|n| n.id == id) {
                let node = st.push_wait.remove(pos).unwrap();
                out.push(Fired::State(node.ntf, AsyncState::Overtime));
            }
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

    /// Serve the head pop waiter, assuming the buffer is non-empty.
    /// A consume waiter takes the head value and promotes one parked
    /// pusher; a watch waiter just wakes.
    fn serve_pop_waiter(st: &mut ChanState<T>, out: &mut Vec<Fired<T>>) {
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
                Self::promote_pusher(st, out);
                out.push(Fired::Pop(ntf, AsyncState::Ok, Some(msg)));
            }
            PopKind::Watch { ntf, sign } => {
                sign.take_registered();
                out.push(Fired::State(ntf, AsyncState::Ok));
            }
        }
    }

    /// Move one parked pusher's value into the buffer and complete it,
    /// then let the freshly buffered value wake another waiter.
    fn promote_pusher(st: &mut ChanState<T>, out: &mut Vec<Fired<T>>) {
        if st.buf.len() >= st.cap {
            return;
        }
        if let Some(node) = st.push_wait.pop_front() {
            if let Some(t) = &node.timer {
                t.cancel();
            }
            st.buf.push_back(node.msg);
            Self::serve_pop_waiter(st, out);
            out.push(Fired::State(node.ntf, AsyncState::Ok));
        }
    }

    fn drain_pop_waiters(st: &mut ChanState<T>, state: AsyncState, out: &mut Vec<Fired<T>>) {
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
