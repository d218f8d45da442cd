//! Multi-way select over channels
//!
//! Go-style select built on the watch-only notify protocol: no case
//! consumes data until it has won. The coordinator owns a private
//! unbounded pump; each armed case registers a watch notify that pushes
//! its case id into the pump, and one pump pop picks the winner.
//!
//! Protocol, per iteration:
//!
//! 1. `arm(id, chan)` every case of interest
//! 2. `wait(..)` pops one winning id from the pump
//! 3. the winner's body calls `try_pop` on its channel; the data may
//!    have been stolen by another consumer, in which case the case
//!    re-arms and the iteration loops (spurious wakeup)
//! 4. a looping select re-arms the winner; a one-shot select
//!    `retract`s every case and `close`s the pump
//!
//! Retracting a case whose watch already fired wakes one other waiter
//! in compensation, so readiness is never swallowed. Select regions in
//! a generator bracket themselves with `co_lock_stop!`/`co_unlock_stop!`
//! so cancellation cannot strand a registration.

use crate::msgq::MsgBuffer;
use crate::notify::StateNotify;

use costrand_core::sign::NotifySign;
use costrand_core::state::AsyncState;
use costrand_runtime::strand::Strand;

use std::collections::HashMap;

/// A channel that supports watch-only readiness registration
pub trait SelectSource {
    fn append_pop_notify(&self, ntf: StateNotify, sign: &NotifySign);
    fn remove_pop_notify(&self, ntf: StateNotify, sign: &NotifySign);
}

impl<T: Send + 'static> SelectSource for crate::chan::Chan<T> {
    fn append_pop_notify(&self, ntf: StateNotify, sign: &NotifySign) {
        crate::chan::Chan::append_pop_notify(self, ntf, sign)
    }

    fn remove_pop_notify(&self, ntf: StateNotify, sign: &NotifySign) {
        crate::chan::Chan::remove_pop_notify(self, ntf, sign)
    }
}

impl<T: Send + 'static> SelectSource for crate::msgq::MsgBuffer<T> {
    fn append_pop_notify(&self, ntf: StateNotify, sign: &NotifySign) {
        crate::msgq::MsgBuffer::append_pop_notify(self, ntf, sign)
    }

    fn remove_pop_notify(&self, ntf: StateNotify, sign: &NotifySign) {
        crate::msgq::MsgBuffer::remove_pop_notify(self, ntf, sign)
    }
}

impl<T: Send + 'static> SelectSource for crate::nilchan::NilChan<T> {
    fn append_pop_notify(&self, ntf: StateNotify, sign: &NotifySign) {
        crate::nilchan::NilChan::append_pop_notify(self, ntf, sign)
    }

    fn remove_pop_notify(&self, ntf: StateNotify, sign: &NotifySign) {
        crate::nilchan::NilChan::remove_pop_notify(self, ntf, sign)
    }
}

/// Select coordinator: a private pump plus one watch sign per case
pub struct Select {
    pump: MsgBuffer<usize>,
    signs: HashMap<usize, NotifySign>,
}

impl Select {
    /// Create a coordinator whose pump lives on `strand` (normally the
    /// selecting generator's strand)
    pub fn new(strand: &Strand) -> Self {
        Self {
            pump: MsgBuffer::new(strand),
            signs: HashMap::new(),
        }
    }

    /// The pump's strand
    pub fn strand(&self) -> &Strand {
        self.pump.strand()
    }

    /// The watch sign for a case, created on first use
    pub fn sign(&mut self, id: usize) -> NotifySign {
        self.signs.entry(id).or_default().clone()
    }

    /// Arm case `id` on `src`: when data shows up, `id` lands in the
    /// pump. Fires immediately if data is already present.
    pub fn arm<S>(&mut self, id: usize, src: &S)
    where
        S: SelectSource + ?Sized,
    {
        let pump = self.pump.clone();
        let sign = self.sign(id);
        src.append_pop_notify(Box::new(move |_state| pump.push(|_| {}, id)), &sign);
    }

    /// Pop the winning case id. Completes `Ok` with the id, or `Closed`
    /// after `close`.
    pub fn wait<N>(&self, ntf: N)
    where
        N: FnOnce(AsyncState, Option<usize>) + Send + 'static,
    {
        self.pump.pop(ntf);
    }

    /// Retract case `id`'s registration. `ntf` completes `Ok` if the
    /// watch was still parked, `Fail` if it had already fired (another
    /// waiter is woken in compensation when data remains).
    pub fn retract<S, N>(&mut self, id: usize, src: &S, ntf: N)
    where
        S: SelectSource + ?Sized,
        N: FnOnce(AsyncState) + Send + 'static,
    {
        let sign = self.sign(id);
        src.remove_pop_notify(Box::new(ntf), &sign);
    }

    /// Close the pump and drain stragglers; late case notifies push
    /// into a closed pump and vanish
    pub fn close<N>(&self, ntf: N)
    where
        N: FnOnce() + Send + 'static,
    {
        self.pump.close_with(ntf);
    }

    /// Re-open for the next select region
    pub fn reset(&mut self) {
        self.pump.reset();
        self.signs.clear();
    }
}

/// A fresh coordinator on the same strand: pump contents and case
/// registrations are deliberately not carried over (matters for forked
/// generators holding a select in their frame)
impl Clone for Select {
    fn clone(&self) -> Self {
        Self {
            pump: MsgBuffer::new(self.pump.strand()),
            signs: HashMap::new(),
        }
    }
}
