//! Disarm flags and registration tokens for late callbacks
//!
//! `SharedSign` is the reference-counted tri-state flag a cancelled
//! generator leaves behind: callbacks that may fire after the generator
//! is gone hold a clone and check it before touching anything else.
//!
//! `NotifySign` is the per-waiter token used by the watch-only
//! (`append_pop_notify`/`remove_pop_notify`) channel protocol: it
//! remembers whether a registration is still parked in the wait queue,
//! and if so under which node id, so `remove_pop_notify` can retract it.

use core::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::spinlock::SpinLock;

const SIGN_UNSET: u8 = 0;
const SIGN_FALSE: u8 = 1;
const SIGN_TRUE: u8 = 2;

/// Shared tri-state boolean (unset, false, true) with idempotent set
///
/// Clones share the cell. Setting the same value twice is a no-op;
/// the typical life cycle is unset -> true (disarmed).
#[derive(Clone)]
pub struct SharedSign {
    cell: Arc<AtomicU8>,
}

impl SharedSign {
    /// Create a new, unset sign
    pub fn new() -> Self {
        Self {
            cell: Arc::new(AtomicU8::new(SIGN_UNSET)),
        }
    }

    /// Set the sign
    #[inline]
    pub fn set(&self, value: bool) {
        let v = if value { SIGN_TRUE } else { SIGN_FALSE };
        self.cell.store(v, Ordering::Release);
    }

    /// Current value, `None` while unset
    #[inline]
    pub fn get(&self) -> Option<bool> {
        match self.cell.load(Ordering::Acquire) {
            SIGN_UNSET => None,
            SIGN_FALSE => Some(false),
            _ => Some(true),
        }
    }

    /// True iff the sign has been set to true (callback disarmed)
    #[inline]
    pub fn is_true(&self) -> bool {
        self.cell.load(Ordering::Acquire) == SIGN_TRUE
    }
}

impl Default for SharedSign {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SharedSign {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSign").field("value", &self.get()).finish()
    }
}

/// State of a watch-only channel registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignState {
    /// No registration parked (never registered, or already fired)
    Idle,

    /// Parked in a wait queue under this node id
    Registered(u64),
}

/// Registration token for watch-only channel waiters
///
/// Owned by the select coordinator, shared with the channel. All
/// transitions happen on the channel's strand.
#[derive(Clone)]
pub struct NotifySign {
    inner: Arc<SpinLock<SignState>>,
}

impl NotifySign {
    /// Create an idle sign
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SpinLock::new(SignState::Idle)),
        }
    }

    /// Record a parked registration. The sign must be idle.
    pub fn set_registered(&self, node: u64) {
        let mut st = self.inner.lock();
        debug_assert_eq!(*st, SignState::Idle, "sign already registered");
        *st = SignState::Registered(node);
    }

    /// Consume the registration, returning the node id if one was parked.
    ///
    /// Called both when the watch notify fires (the waiter left the
    /// queue) and when `remove_pop_notify` retracts it.
    pub fn take_registered(&self) -> Option<u64> {
        let mut st = self.inner.lock();
        match *st {
            SignState::Registered(node) => {
                *st = SignState::Idle;
                Some(node)
            }
            SignState::Idle => None,
        }
    }

    /// True iff a registration is currently parked
    pub fn is_registered(&self) -> bool {
        matches!(*self.inner.lock(), SignState::Registered(_))
    }
}

impl Default for NotifySign {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NotifySign {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifySign")
            .field("registered", &self.is_registered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_sign_tristate() {
        let sign = SharedSign::new();
        assert_eq!(sign.get(), None);
        assert!(!sign.is_true());

        sign.set(false);
        assert_eq!(sign.get(), Some(false));

        sign.set(true);
        assert!(sign.is_true());

        // Idempotent
        sign.set(true);
        assert!(sign.is_true());
    }

    #[test]
    fn test_shared_sign_clone_shares() {
        let a = SharedSign::new();
        let b = a.clone();
        a.set(true);
        assert!(b.is_true());
    }

    #[test]
    fn test_notify_sign_lifecycle() {
        let sign = NotifySign::new();
        assert!(!sign.is_registered());
        assert_eq!(sign.take_registered(), None);

        sign.set_registered(42);
        assert!(sign.is_registered());
        assert_eq!(sign.take_registered(), Some(42));
        assert!(!sign.is_registered());
        assert_eq!(sign.take_registered(), None);
    }
}
