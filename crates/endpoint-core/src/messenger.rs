//! Messenger Base Contract
//!
//! [`MessengerCore`] owns what every messenger shares: the current state, the
//! state-change notifier, and the set of threads blocked on the messenger.
//! [`Messenger`] is the contract transports and applications program against;
//! its provided methods layer the synchronous conveniences (`wait_state`,
//! `flush`, `send_message`) over the asynchronous primitives an implementation
//! supplies.
//!
//! ## Publication order
//!
//! Transitions are *recorded* while the implementation holds its own lock and
//! *delivered* after it releases it. Recorded transitions form a FIFO drained by
//! a single delivering thread at a time, so listeners observe a total order and
//! may call back into the messenger without deadlocking.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;
use parking_lot::{Condvar, Mutex};
use std::thread::{self, ThreadId};
use tracing::{debug, trace};

use crate::address::EndpointAddress;
use crate::barrier::StateBarrier;
use crate::errors::{EndpointError, Result};
use crate::message::{Message, SendOutcome};
use crate::notifier::{MessengerStateListener, StateChangeNotifier};
use crate::state::{MessengerState, StateMask};
use crate::waiters::{Interruptible, WaiterRegistry};

static NEXT_MESSENGER_ID: AtomicU64 = AtomicU64::new(1);

// ----------------------------------------------------------------------------
// Messenger Core
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Publication {
    pending: VecDeque<MessengerState>,
    delivering: Option<ThreadId>,
    recorded: u64,
    delivered: u64,
}

/// State shared by every messenger implementation
pub struct MessengerCore {
    id: u64,
    destination: EndpointAddress,
    logical_destination: EndpointAddress,
    state: Mutex<MessengerState>,
    notifier: StateChangeNotifier,
    publication: Mutex<Publication>,
    published: Condvar,
    waiters: WaiterRegistry,
}

impl MessengerCore {
    /// Create a core starting in `initial`
    pub fn new(
        initial: MessengerState,
        destination: EndpointAddress,
        logical_destination: EndpointAddress,
    ) -> Self {
        Self {
            id: NEXT_MESSENGER_ID.fetch_add(1, Ordering::Relaxed),
            destination,
            logical_destination,
            state: Mutex::new(initial),
            notifier: StateChangeNotifier::new(),
            publication: Mutex::new(Publication::default()),
            published: Condvar::new(),
            waiters: WaiterRegistry::default(),
        }
    }

    /// Process-unique messenger id
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn destination(&self) -> &EndpointAddress {
        &self.destination
    }

    pub fn logical_destination(&self) -> &EndpointAddress {
        &self.logical_destination
    }

    /// Latest recorded state, possibly not yet delivered to listeners
    pub fn state(&self) -> MessengerState {
        *self.state.lock()
    }

    pub fn notifier(&self) -> &StateChangeNotifier {
        &self.notifier
    }

    /// Record transitions for delivery, in order.
    ///
    /// Nothing is recorded once a terminal state has been recorded. Safe to
    /// call while holding an implementation lock; call
    /// [`deliver_pending`](Self::deliver_pending) once that lock is released.
    pub fn record_transitions(&self, transitions: &[MessengerState]) -> bool {
        let mut state = self.state.lock();
        if state.is_terminal() {
            debug!(
                messenger = self.id,
                "Ignoring transitions {:?} after terminal {}", transitions, *state
            );
            return false;
        }
        let mut publication = self.publication.lock();
        for &next in transitions {
            debug!(messenger = self.id, "{} -> {}", *state, next);
            *state = next;
            publication.pending.push_back(next);
            publication.recorded += 1;
            if next.is_terminal() {
                break;
            }
        }
        true
    }

    /// Deliver recorded transitions to listeners.
    ///
    /// If another thread is already delivering, it picks up the new
    /// transitions and this call blocks until everything recorded so far has
    /// been delivered. A listener calling back from inside a delivery returns
    /// at once; its transitions follow after the current one.
    pub fn deliver_pending(&self) {
        let me = thread::current().id();
        {
            let mut publication = self.publication.lock();
            match publication.delivering {
                Some(owner) if owner == me => return,
                Some(_) => {
                    let target = publication.recorded;
                    while publication.delivered < target {
                        self.published.wait(&mut publication);
                    }
                    return;
                }
                None => publication.delivering = Some(me),
            }
        }

        let mut publication = self.publication.lock();
        while let Some(next) = publication.pending.pop_front() {
            drop(publication);
            let invoked = self.notifier.notify_new_state(&next);
            trace!(messenger = self.id, listeners = invoked, "Delivered {}", next);

            publication = self.publication.lock();
            publication.delivered += 1;
            self.published.notify_all();
        }
        publication.delivering = None;
    }

    /// Record and immediately deliver transitions
    pub fn publish(&self, transitions: &[MessengerState]) -> bool {
        let recorded = self.record_transitions(transitions);
        self.deliver_pending();
        recorded
    }

    /// Block until the state matches `mask` or `timeout` elapses (zero waits forever).
    ///
    /// Returns the matched state, or the current state on timeout.
    pub fn wait_state(&self, mask: StateMask, timeout: Duration) -> Result<MessengerState> {
        let barrier = Arc::new(StateBarrier::new(mask));
        let listener = barrier.listener();
        self.notifier.add_listener(listener.clone());

        // Registered first, so a concurrent change cannot be missed.
        let current = self.state();
        if current.matches(mask) {
            barrier.expire();
            self.notifier.remove_listener(&listener);
            return Ok(current);
        }

        self.waiters.register(barrier.clone());
        let result = barrier.await_match(timeout);
        barrier.expire();
        self.notifier.remove_listener(&listener);

        match result {
            Ok(Some(matched)) => Ok(matched),
            Ok(None) => Ok(self.state()),
            Err(err) => Err(EndpointError::io_caused_by(err)),
        }
    }

    /// Track a blocking point so [`interrupt_waiters`](Self::interrupt_waiters) can reach it
    pub fn register_waiter(&self, waiter: Arc<dyn Interruptible>) {
        self.waiters.register(waiter);
    }

    /// Interrupt every thread currently blocked on this messenger
    pub fn interrupt_waiters(&self) -> usize {
        self.waiters.interrupt_all()
    }
}

impl fmt::Debug for MessengerCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessengerCore")
            .field("id", &self.id)
            .field("destination", &self.destination.to_string())
            .field("state", &self.state())
            .field("listeners", &self.notifier.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Messenger Trait
// ----------------------------------------------------------------------------

/// A logical connection to one remote endpoint
pub trait Messenger: Send + Sync {
    /// Shared state of this messenger
    fn core(&self) -> &MessengerCore;

    /// Queue `message` without blocking.
    ///
    /// Returns `false` when the message was not accepted; the message's result
    /// marker tells overflow (retry later) apart from failure.
    fn send_message_n(
        &self,
        message: &Message,
        service: Option<&str>,
        service_param: Option<&str>,
    ) -> bool;

    /// Queue `message`, blocking for queue space and then for the transport's outcome
    fn send_message_b(
        &self,
        message: &Message,
        service: Option<&str>,
        service_param: Option<&str>,
    ) -> Result<()>;

    /// Request a close; the messenger reaches `CLOSED` once its queue drains
    fn close(&self);

    /// Ask the transport to resolve the destination, if not resolved yet
    fn resolve(&self) {}

    /// Whether nothing is queued or in flight
    fn is_idle(&self) -> bool {
        self.state().matches(StateMask::QUIESCENT)
    }

    /// Interrupt every thread blocked on this messenger
    fn interrupt_waiters(&self) -> usize {
        self.core().interrupt_waiters()
    }

    fn id(&self) -> u64 {
        self.core().id()
    }

    fn state(&self) -> MessengerState {
        self.core().state()
    }

    fn is_closed(&self) -> bool {
        !self.state().is_usable()
    }

    fn destination_address(&self) -> &EndpointAddress {
        self.core().destination()
    }

    fn logical_destination_address(&self) -> &EndpointAddress {
        self.core().logical_destination()
    }

    fn add_state_listener(&self, listener: MessengerStateListener) -> bool {
        self.core().notifier().add_listener(listener)
    }

    fn remove_state_listener(&self, listener: &MessengerStateListener) -> bool {
        self.core().notifier().remove_listener(listener)
    }

    /// Block until the state is one of `wanted`, or `timeout` elapses (zero waits forever)
    fn wait_state(&self, wanted: StateMask, timeout: Duration) -> Result<MessengerState> {
        self.core().wait_state(wanted, timeout)
    }

    /// Block until nothing is left to send
    fn flush(&self) -> Result<()> {
        let final_state = self.wait_state(StateMask::QUIESCENT, Duration::ZERO)?;
        if final_state.matches(StateMask::CLOSED | StateMask::USABLE) {
            return Ok(());
        }
        Err(EndpointError::UnexpectedlyClosed)
    }

    /// Submit without blocking, turning a recorded failure into an error.
    ///
    /// `Ok(true)`: accepted. `Ok(false)`: queue saturated, try again later.
    fn send_message(
        &self,
        message: &Message,
        service: Option<&str>,
        service_param: Option<&str>,
    ) -> Result<bool> {
        if self.send_message_n(message, service, service_param) {
            return Ok(true);
        }
        match message.outcome() {
            Some(SendOutcome::Failed(err)) => Err(rethrow(err)),
            _ => Ok(false),
        }
    }

    /// Same as [`close`](Self::close)
    fn cancel(&self) {
        self.close()
    }
}

/// Surface a recorded failure with its own type where it has one the caller
/// can act on, otherwise as an I/O failure wrapping it.
fn rethrow(err: EndpointError) -> EndpointError {
    match err {
        err if err.is_io() => err,
        err @ (EndpointError::Runtime { .. } | EndpointError::Fatal { .. }) => err,
        other => EndpointError::io_caused_by(other),
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
