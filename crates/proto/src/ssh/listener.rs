//! Session and channel event listeners.
//!
//! Listener sets hold shared snapshots: registration takes the set lock,
//! dispatch clones the current vector and iterates without it. A listener
//! that panics is isolated and logged; the remaining listeners still run.
//! Once the owning session starts closing, further registrations are
//! rejected and the set is cleared.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Events observable on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Algorithm negotiation finished and a key exchange is running.
    KexCompleted,
    /// Freshly derived keys were installed (NEWKEYS processed).
    KeyEstablished,
    /// The upstream service reported successful authentication.
    Authenticated,
}

/// Observer of session lifecycle events.
pub trait SessionListener: Send + Sync {
    /// Called for every [`SessionEvent`].
    fn session_event(&self, event: SessionEvent) {
        let _ = event;
    }

    /// Called once when the session closes.
    fn session_closed(&self) {}
}

/// Events observable on a channel.
///
/// Channel multiplexing itself lives upstream; the transport only relays
/// the notifications services ask it to fan out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A channel finished opening.
    Opened,
    /// A channel was torn down.
    Closed,
}

/// Observer of channel lifecycle events.
pub trait ChannelListener: Send + Sync {
    /// Called for every [`ChannelEvent`] with the channel id.
    fn channel_event(&self, channel_id: u32, event: ChannelEvent) {
        let _ = (channel_id, event);
    }
}

/// A set of listeners with snapshot iteration and closed-set rejection.
pub struct ListenerSet<L: ?Sized> {
    listeners: Mutex<Vec<Arc<L>>>,
    closed: AtomicBool,
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }
}

impl<L: ?Sized> ListenerSet<L> {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener.
    ///
    /// Returns `false` (and does not register) once the set is closed, or
    /// when the same listener instance is already registered.
    pub fn add(&self, listener: Arc<L>) -> bool {
        if self.closed.load(Ordering::Acquire) {
            warn!("Ignoring listener registration on closing session");
            return false;
        }
        let mut listeners = self.listeners.lock().expect("listener lock poisoned");
        if listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Removes a listener by identity.
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut listeners = self.listeners.lock().expect("listener lock poisoned");
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// Clones the current listener vector for lock-free iteration.
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .clone()
    }

    /// Marks the set closed and drops all registrations.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .clear();
    }

    /// Dispatches one event to every listener in the snapshot.
    ///
    /// A panicking listener is logged and skipped; the rest still run.
    pub fn dispatch(&self, mut call: impl FnMut(&L)) {
        for listener in self.snapshot() {
            if catch_unwind(AssertUnwindSafe(|| call(&listener))).is_err() {
                warn!("Listener panicked during event dispatch");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        events: AtomicUsize,
    }

    impl SessionListener for Counting {
        fn session_event(&self, _event: SessionEvent) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicking;

    impl SessionListener for Panicking {
        fn session_event(&self, _event: SessionEvent) {
            panic!("listener bug");
        }
    }

    fn counting() -> Arc<Counting> {
        Arc::new(Counting {
            events: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_add_remove() {
        let set: ListenerSet<dyn SessionListener> = ListenerSet::new();
        let listener = counting();

        assert!(set.add(listener.clone()));
        assert!(!set.add(listener.clone()), "duplicate must be rejected");
        assert!(set.remove(&(listener.clone() as Arc<dyn SessionListener>)));
        assert_eq!(set.snapshot().len(), 0);
    }

    #[test]
    fn test_dispatch_reaches_all() {
        let set: ListenerSet<dyn SessionListener> = ListenerSet::new();
        let a = counting();
        let b = counting();
        set.add(a.clone());
        set.add(b.clone());

        set.dispatch(|l| l.session_event(SessionEvent::KeyEstablished));
        assert_eq!(a.events.load(Ordering::SeqCst), 1);
        assert_eq!(b.events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let set: ListenerSet<dyn SessionListener> = ListenerSet::new();
        let survivor = counting();
        set.add(Arc::new(Panicking));
        set.add(survivor.clone());

        set.dispatch(|l| l.session_event(SessionEvent::Authenticated));
        assert_eq!(survivor.events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_closed_set_rejects_registration() {
        let set: ListenerSet<dyn SessionListener> = ListenerSet::new();
        set.close();
        assert!(!set.add(counting()));
        assert!(set.snapshot().is_empty());
    }
}
