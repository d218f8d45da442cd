//! Unbuffered (rendezvous) channel
//!
//! No ring buffer: a pusher moves its value into a single-slot
//! temporary and parks at the head of the push queue as the slot's
//! owner. A popper consumes the slot, completes the owner, and the next
//! parked pusher is promoted into the freed slot. Push completions
//! therefore fire on hand-off, never on submission.
//!
//! `try_push` only fails while another pusher owns the slot: grabbing
//! the free slot succeeds immediately but still completes on hand-off.

use crate::chan::{PopKind, PopNode};
use crate::notify::{fire_all, Fired, PlainNotify, PopNotify, StateNotify};

use costrand_core::sign::NotifySign;
use costrand_core::spinlock::SpinLock;
use costrand_core::state::AsyncState;
use costrand_runtime::strand::Strand;
use costrand_runtime::timer::AsyncTimer;

use std::collections::VecDeque;
use std::sync::Arc;

/// A parked pusher. `msg: None` marks the slot owner (its value sits in
/// `temp`); `msg: Some` is parked behind the owner.
struct NilPushNode<T> {
    id: u64,
    msg: Option<T>,
    ntf: StateNotify,
    timer: Option<AsyncTimer>,
}

struct NilState<T> {
    temp: Option<T>,
    push_wait: VecDeque<NilPushNode<T>>,
    pop_wait: VecDeque<PopNode<T>>,
    closed: bool,
    next_node: u64,
}

impl<T> NilState<T> {
    fn alloc_id(&mut self) -> u64 {
        let id = self.next_node;
        self.next_node += 1;
        id
    }
}

struct NilInner<T> {
    strand: Strand,
    st: SpinLock<NilState<T>>,
}

/// Handle to a rendezvous channel. Clones share the channel.
pub struct NilChan<T> {
    inner: Arc<NilInner<T>>,
}

impl<T> Clone for NilChan<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> NilChan<T> {
    pub fn new(strand: &Strand) -> Self {
        Self {
            inner: Arc::new(NilInner {
                strand: strand.clone(),
                st: SpinLock::new(NilState {
                    temp: None,
                    push_wait: VecDeque::new(),
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

    /// Push `msg`; completes `Ok` when a popper takes it
    pub fn push<N>(&self, ntf: N, msg: T)
    where
        N: FnOnce(AsyncState) + Send + 'static,
    {
        let ch = self.clone();
        self.inner
            .strand
            .distribute(move || ch.do_push(msg, Box::new(ntf), None, None));
    }

    /// Push that fails with `Fail` if another pusher already owns the
    /// slot; otherwise identical to `push`
    pub fn try_push<N>(&self, ntf: N, msg: T)
    where
        N: FnOnce(AsyncState) + Send + 'static,
    {
        let ch = self.clone();
        self.inner
            .strand
            .distribute(move || ch.do_try_push(msg, Box::new(ntf)));
    }

    /// Push with a deadline on the wait for the slot. Once the slot is
    /// owned the hand-off is awaited without a deadline.
    pub fn timed_push<N>(&self, timer: &AsyncTimer, ms: u64, ntf: N, msg: T)
    where
        N: FnOnce(AsyncState) + Send + 'static,
    {
        debug_assert!(timer.strand() == &self.inner.strand);
        let ch = self.clone();
        let timer = timer.clone();
        self.inner
            .strand
            .distribute(move || ch.do_push(msg, Box::new(ntf), Some(timer), Some(ms)));
    }

    /// Pop: consume the slot and wake its owner, or park
    pub fn pop<N>(&self, ntf: N)
    where
        N: FnOnce(AsyncState, Option<T>) + Send + 'static,
    {
        let ch = self.clone();
        self.inner
            .strand
            .distribute(move || ch.do_pop(Box::new(ntf)));
    }

    pub fn try_pop<N>(&self, ntf: N)
    where
        N: FnOnce(AsyncState, Option<T>) + Send + 'static,
    {
        let ch = self.clone();
        self.inner
            .strand
            .distribute(move || ch.do_try_pop(Box::new(ntf)));
    }

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

    /// Watch-only readiness registration
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

    /// Retract a watch registration
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

    pub fn close(&self) {
        let ch = self.clone();
        self.inner.strand.distribute(move || ch.do_close(None));
    }

    pub fn close_with<N>(&self, ntf: N)
    where
        N: FnOnce() + Send + 'static,
    {
        let ch = self.clone();
        self.inner
            .strand
            .distribute(move || ch.do_close(Some(Box::new(ntf))));
    }

    pub fn cancel(&self) {
        let ch = self.clone();
        self.inner
            .strand
            .distribute(move || ch.do_cancel(true, true, None));
    }

    pub fn cancel_with<N>(&self, ntf: N)
    where
        N: FnOnce() + Send + 'static,
    {
        let ch = self.clone();
        self.inner
            .strand
            .distribute(move || ch.do_cancel(true, true, Some(Box::new(ntf))));
    }

    pub fn cancel_push(&self) {
        let ch = self.clone();
        self.inner
            .strand
            .distribute(move || ch.do_cancel(true, false, None));
    }

    pub fn cancel_push_with<N>(&self, ntf: N)
    where
        N: FnOnce() + Send + 'static,
    {
        let ch = self.clone();
        self.inner
            .strand
            .distribute(move || ch.do_cancel(true, false, Some(Box::new(ntf))));
    }

    pub fn cancel_pop(&self) {
        let ch = self.clone();
        self.inner
            .strand
            .distribute(move || ch.do_cancel(false, true, None));
    }

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

    fn do_push(&self, msg: T, ntf: StateNotify, timer: Option<AsyncTimer>, ms: Option<u64>) {
        debug_assert!(self.inner.strand.running_in_this_thread());
        let mut out: Vec<Fired<T>> = Vec::new();
        {
            let mut st = self.inner.st.lock();
            if st.closed {
                out.push(Fired::State(ntf, AsyncState::Closed));
            } else if st.temp.is_some() {
                match (timer, ms) {
                    (Some(timer), Some(ms)) if ms > 0 => {
                        let id = st.alloc_id();
                        st.push_wait.push_back(NilPushNode {
                            id,
                            msg: Some(msg),
                            ntf,
                            timer: Some(timer.clone()),
                        });
                        let ch = self.clone();
                        timer.timeout(ms, move || ch.expire_push(id));
                    }
                    (Some(_), Some(_)) => {
                        out.push(Fired::State(ntf, AsyncState::Overtime));
                    }
                    _ => {
                        let id = st.alloc_id();
                        st.push_wait.push_back(NilPushNode {
                            id,
                            msg: Some(msg),
                            ntf,
                            timer: None,
                        });
                    }
                }
            } else {
                Self::take_slot(&mut st, msg, ntf);
                Self::serve_pop_waiter(&mut st, &mut out);
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
            } else if st.temp.is_some() {
                out.push(Fired::State(ntf, AsyncState::Fail));
            } else {
                Self::take_slot(&mut st, msg, ntf);
                Self::serve_pop_waiter(&mut st, &mut out);
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
            } else if let Some(msg) = st.temp.take() {
                debug_assert!(!st.push_wait.is_empty());
                Self::wake_front_pusher(&mut st, &mut out);
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
            } else if let Some(msg) = st.temp.take() {
                debug_assert!(!st.push_wait.is_empty());
                Self::wake_front_pusher(&mut st, &mut out);
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
            } else if let Some(msg) = st.temp.take() {
                debug_assert!(!st.push_wait.is_empty());
                Self::wake_front_pusher(&mut st, &mut out);
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
            } else if st.temp.is_some() {
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
                if st.temp.is_some() && !st.pop_wait.is_empty() {
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
            st.temp = None;
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

    fn do_cancel(&self, push_side: bool, pop_side: bool, ntf: Option<PlainNotify>) {
        debug_assert!(self.inner.strand.running_in_this_thread());
        let mut out: Vec<Fired<T>> = Vec::new();
        {
            let mut st = self.inner.st.lock();
            if push_side {
                st.temp = None;
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

    /// Claim the free slot: the value moves to `temp` and the pusher
    /// parks at the head of the queue as its owner.
    fn take_slot(st: &mut NilState<T>, msg: T, ntf: StateNotify) {
        debug_assert!(st.temp.is_none());
        debug_assert!(st.push_wait.is_empty());
        st.temp = Some(msg);
        let id = st.alloc_id();
        st.push_wait.push_back(NilPushNode {
            id,
            msg: None,
            ntf,
            timer: None,
        });
    }

    /// Complete the head pusher after the slot was consumed. An owner
    /// node first promotes whatever is behind it, then fires its user
    /// notify; a parked node re-takes the now-free slot.
    fn wake_front_pusher(st: &mut NilState<T>, out: &mut Vec<Fired<T>>) {
        let node = match st.push_wait.pop_front() {
            Some(node) => node,
            None => return,
        };
        if let Some(t) = &node.timer {
            t.cancel();
        }
        match node.msg {
            None => {
                Self::wake_front_pusher(st, out);
                out.push(Fired::State(node.ntf, AsyncState::Ok));
            }
            Some(msg) => {
                debug_assert!(st.temp.is_none());
                st.temp = Some(msg);
                st.push_wait.push_back(NilPushNode {
                    id: node.id,
                    msg: None,
                    ntf: node.ntf,
                    timer: None,
                });
                Self::serve_pop_waiter(st, out);
            }
        }
    }

    /// Serve the head pop waiter while a value sits in the slot
    fn serve_pop_waiter(st: &mut NilState<T>, out: &mut Vec<Fired<T>>) {
        if st.temp.is_none() {
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
                let msg = st.temp.take().unwrap();
                Self::wake_front_pusher(st, out);
                out.push(Fired::Pop(ntf, AsyncState::Ok, Some(msg)));
            }
            PopKind::Watch { ntf, sign } => {
                sign.take_registered();
                out.push(Fired::State(ntf, AsyncState::Ok));
            }
        }
    }

    fn drain_pop_waiters(st: &mut NilState<T>, state: AsyncState, out: &mut Vec<Fired<T>>) {
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
