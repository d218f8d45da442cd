//! Boxed notify types shared by the channel family
//!
//! Channel state is mutated under a lock on the owning strand; user
//! notifies are never invoked while it is held. Mutating code appends
//! `Fired` records to a scratch list and the caller replays them after
//! releasing the lock, preserving the order decisions were made in.

use costrand_core::state::AsyncState;

/// Notify for operations that complete with a state only
/// (push, lock, watch registrations)
pub type StateNotify = Box<dyn FnOnce(AsyncState) + Send>;

/// Notify for operations that deliver a value (pop)
pub type PopNotify<T> = Box<dyn FnOnce(AsyncState, Option<T>) + Send>;

/// Notify for operations with no payload at all (close, cancel)
pub type PlainNotify = Box<dyn FnOnce() + Send>;

/// A notify invocation recorded under the state lock
pub(crate) enum Fired<T> {
    State(StateNotify, AsyncState),
    Pop(PopNotify<T>, AsyncState, Option<T>),
    Plain(PlainNotify),
}

/// Replay recorded notifies in order
pub(crate) fn fire_all<T>(out: Vec<Fired<T>>) {
    for fired in out {
        match fired {
            Fired::State(ntf, state) => ntf(state),
            Fired::Pop(ntf, state, value) => ntf(state, value),
            Fired::Plain(ntf) => ntf(),
        }
    }
}
