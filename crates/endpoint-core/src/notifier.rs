//! Self-Pruning Change Notifier
//!
//! A thread-safe multicast registry. Each listener returns whether it wants to
//! keep receiving notifications; listeners that answer `false` are swept out
//! after the pass that produced the answer. Notification works on a snapshot,
//! so listeners may add or remove listeners from inside their own callback.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::warn;

use crate::state::MessengerState;

// ----------------------------------------------------------------------------
// Listener Types
// ----------------------------------------------------------------------------

/// A change listener; returns `false` to unregister itself
pub type Listener<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Listener for messenger state changes
pub type MessengerStateListener = Listener<MessengerState>;

/// Notifier publishing messenger state changes
pub type StateChangeNotifier = ChangeNotifier<MessengerState>;

/// Wrap a closure as a shareable listener
pub fn listener<E, F>(f: F) -> Listener<E>
where
    F: Fn(&E) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

fn same_listener<E>(a: &Listener<E>, b: &Listener<E>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

// ----------------------------------------------------------------------------
// Change Notifier
// ----------------------------------------------------------------------------

/// Multicast registry of change listeners
pub struct ChangeNotifier<E> {
    listeners: Mutex<Vec<Listener<E>>>,
}

impl<E: fmt::Debug> ChangeNotifier<E> {
    /// Create an empty notifier
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Register a listener. Registering the same listener twice is a no-op.
    pub fn add_listener(&self, listener: Listener<E>) -> bool {
        let mut listeners = self.listeners.lock();
        if listeners.iter().any(|l| same_listener(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Unregister a listener, returning whether it was registered
    pub fn remove_listener(&self, listener: &Listener<E>) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| !same_listener(l, listener));
        listeners.len() != before
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Whether no listener is registered
    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    /// Invoke every registered listener once with `change`.
    ///
    /// Panicking listeners are logged and stay registered. Returns the number of
    /// listeners invoked.
    pub fn notify_new_state(&self, change: &E) -> usize {
        let snapshot: Vec<Listener<E>> = self.listeners.lock().clone();
        let mut unregister: Vec<Listener<E>> = Vec::new();

        for listener in &snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(change))) {
                Ok(true) => {}
                Ok(false) => unregister.push(listener.clone()),
                Err(_) => {
                    warn!("Listener panicked while handling {:?}; ignoring", change);
                }
            }
        }

        if !unregister.is_empty() {
            self.listeners
                .lock()
                .retain(|l| !unregister.iter().any(|gone| same_listener(l, gone)));
        }

        snapshot.len()
    }
}

impl<E: fmt::Debug> Default for ChangeNotifier<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for ChangeNotifier<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: Arc<AtomicUsize>, keep: bool) -> MessengerStateListener {
        listener(move |_: &MessengerState| {
            counter.fetch_add(1, Ordering::SeqCst);
            keep
        })
    }

    #[test]
    fn test_unregistering_listener_gets_current_pass_only() {
        let notifier = StateChangeNotifier::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let c = Arc::new(AtomicUsize::new(0));

        notifier.add_listener(counting(a.clone(), true));
        notifier.add_listener(counting(b.clone(), false));
        notifier.add_listener(counting(c.clone(), true));

        assert_eq!(notifier.notify_new_state(&MessengerState::Sending), 3);
        assert_eq!(notifier.len(), 2);

        assert_eq!(notifier.notify_new_state(&MessengerState::Connected), 2);
        assert_eq!(a.load(Ordering::SeqCst), 2);
        assert_eq!(b.load(Ordering::SeqCst), 1);
        assert_eq!(c.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_pass() {
        let notifier = StateChangeNotifier::new();
        let after = Arc::new(AtomicUsize::new(0));

        notifier.add_listener(listener(|_: &MessengerState| -> bool { panic!("listener failure") }));
        notifier.add_listener(counting(after.clone(), true));

        notifier.notify_new_state(&MessengerState::Closed);
        assert_eq!(after.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.len(), 2);
    }

    #[test]
    fn test_remove_listener_by_identity() {
        let notifier = StateChangeNotifier::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let l = counting(counter.clone(), true);

        assert!(notifier.add_listener(l.clone()));
        assert!(!notifier.add_listener(l.clone()));
        assert!(notifier.remove_listener(&l));
        assert!(!notifier.remove_listener(&l));

        notifier.notify_new_state(&MessengerState::Sending);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_listener_may_remove_itself_during_callback() {
        let notifier = Arc::new(StateChangeNotifier::new());
        let slot: Arc<Mutex<Option<MessengerStateListener>>> = Arc::new(Mutex::new(None));

        let inner_notifier = notifier.clone();
        let inner_slot = slot.clone();
        let l = listener(move |_: &MessengerState| {
            if let Some(me) = inner_slot.lock().take() {
                inner_notifier.remove_listener(&me);
            }
            true
        });
        *slot.lock() = Some(l.clone());
        notifier.add_listener(l);

        notifier.notify_new_state(&MessengerState::Sending);
        assert!(notifier.is_empty());
    }
}
