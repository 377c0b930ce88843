//! Asynchronous Delivery Queue
//!
//! [`AsyncMessenger`] is the messenger every queue-backed transport builds on.
//! Producers submit with [`send_message_n`](Messenger::send_message_n) or
//! [`send_message_b`](Messenger::send_message_b); the transport driver drains
//! with [`AsyncMessenger::pull_messages`], which hands each message to the
//! transport's [`MessengerTransport::send_message_impl`] hook.
//!
//! ## State machine
//!
//! ```text
//! CONNECTED --enqueue--> SENDING --enqueue (full)--> SENDINGSATURATED
//!     ^                     |                               |
//!     +-------drain empties-+------<-- drain frees space ---+
//!
//! any --close (queue empty)--> CLOSED
//! any --close (queue busy)---> CLOSING --drain empties--> CLOSED
//! idle/sending --connection_failed--> RECONNECTING --> BROKEN
//! CLOSING      --connection_failed--> RECONCLOSING --> BROKEN
//! UNRESOLVED   --connection_failed--> DISCONNECTED --> BROKEN
//! UNRESOLVED   --connection_established--> RESOLVED --> CONNECTED|SENDING|SENDINGSATURATED
//! ```
//!
//! All submission, drain, close and failure paths serialize on one lock per
//! messenger. Transitions are recorded under that lock and delivered after it
//! is released.

use alloc::collections::VecDeque;
use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use parking_lot::{Condvar, Mutex, MutexGuard};
use smallvec::SmallVec;
use std::time::Instant;
use tracing::{debug, info, trace};

use crate::address::EndpointAddress;
use crate::config::MessengerConfig;
use crate::errors::{EndpointError, Result};
use crate::message::{Message, QueuedMessage, SendOutcome};
use crate::messenger::{Messenger, MessengerCore};
use crate::state::{MessengerState, StateMask};

type Transitions = SmallVec<[MessengerState; 2]>;

// ----------------------------------------------------------------------------
// Transport Hooks
// ----------------------------------------------------------------------------

/// Hooks a transport supplies to an [`AsyncMessenger`]
pub trait MessengerTransport: Send + Sync {
    /// Take one message for delivery.
    ///
    /// Return `false` if the transport cannot take it right now; the message
    /// goes back to the head of the queue and the drain stops. Once taken, the
    /// transport reports the outcome through the message's completion listener.
    fn send_message_impl(&self, message: QueuedMessage) -> bool;

    /// The messenger finished closing. Invoked exactly once.
    fn request_close(&self);

    /// The messenger wants its destination resolved. Invoked at most once.
    fn request_resolve(&self) {}

    /// Local address of the underlying connection, for diagnostics
    fn local_address(&self) -> Option<EndpointAddress> {
        None
    }
}

// ----------------------------------------------------------------------------
// Queue Statistics
// ----------------------------------------------------------------------------

/// Delivery counters shared with every queued message
#[derive(Debug, Default)]
pub(crate) struct QueueCounters {
    accepted: AtomicU64,
    overflowed: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl QueueCounters {
    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of a delivery queue's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct QueueStats {
    /// Messages currently waiting in the queue
    pub queued: usize,
    /// Queue capacity
    pub capacity: usize,
    /// Messages ever accepted
    pub accepted: u64,
    /// Submissions refused because the queue was full
    pub overflowed: u64,
    /// Messages the transport reported delivered
    pub delivered: u64,
    /// Messages that failed after acceptance
    pub failed: u64,
}

// ----------------------------------------------------------------------------
// Async Messenger
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct QueueInner {
    state: MessengerState,
    queue: VecDeque<QueuedMessage>,
    connected: bool,
    close_requested: bool,
    close_sent: bool,
    resolve_requested: bool,
    draining: bool,
    interrupts: u64,
}

enum Admission {
    Accepted,
    Overflow,
    Closed,
}

/// A messenger backed by a bounded, ordered delivery queue
pub struct AsyncMessenger<T: MessengerTransport> {
    core: MessengerCore,
    transport: T,
    config: MessengerConfig,
    inner: Mutex<QueueInner>,
    space: Condvar,
    counters: Arc<QueueCounters>,
}

impl<T: MessengerTransport> AsyncMessenger<T> {
    /// Create a connected messenger whose logical destination is `destination`
    /// without its service qualification
    pub fn new(transport: T, destination: EndpointAddress, config: MessengerConfig) -> Result<Self> {
        let logical = destination.base();
        Self::build(transport, destination, logical, config, true)
    }

    /// Create a connected messenger with an explicit logical destination
    pub fn with_logical_destination(
        transport: T,
        destination: EndpointAddress,
        logical_destination: EndpointAddress,
        config: MessengerConfig,
    ) -> Result<Self> {
        Self::build(transport, destination, logical_destination, config, true)
    }

    /// Create a messenger whose destination is not resolved yet
    pub fn unresolved(
        transport: T,
        destination: EndpointAddress,
        config: MessengerConfig,
    ) -> Result<Self> {
        let logical = destination.base();
        Self::build(transport, destination, logical, config, false)
    }

    fn build(
        transport: T,
        destination: EndpointAddress,
        logical_destination: EndpointAddress,
        config: MessengerConfig,
        connected: bool,
    ) -> Result<Self> {
        config.validate().map_err(EndpointError::config_error)?;
        let initial = if connected {
            MessengerState::Connected
        } else {
            MessengerState::Unresolved
        };
        Ok(Self {
            core: MessengerCore::new(initial, destination, logical_destination),
            transport,
            config,
            inner: Mutex::new(QueueInner {
                state: initial,
                queue: VecDeque::new(),
                connected,
                close_requested: false,
                close_sent: false,
                resolve_requested: false,
                draining: false,
                interrupts: 0,
            }),
            space: Condvar::new(),
            counters: Arc::new(QueueCounters::default()),
        })
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &MessengerConfig {
        &self.config
    }

    /// Local address of the transport's connection, if it has one
    pub fn local_address(&self) -> Option<EndpointAddress> {
        self.transport.local_address()
    }

    /// Number of messages waiting in the queue
    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Snapshot of the queue counters
    pub fn stats(&self) -> QueueStats {
        let queued = self.queued();
        QueueStats {
            queued,
            capacity: self.config.queue_capacity,
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            overflowed: self.counters.overflowed.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Hand queued messages to the transport, in FIFO order.
    ///
    /// Returns the number of messages the transport took. Does nothing before
    /// the connection is established or after a terminal state.
    pub fn pull_messages(&self) -> usize {
        let mut inner = self.inner.lock();
        if inner.draining || !inner.connected || inner.state.is_terminal() {
            return 0;
        }
        inner.draining = true;

        let mut taken = 0;
        while let Some(next) = inner.queue.pop_front() {
            self.space.notify_all();
            drop(inner);

            let accepted = self.transport.send_message_impl(next.clone());
            // Handles are released before relocking: dropping the last one
            // fires the message's outcome listeners.
            let refused = if accepted {
                next.submitted();
                drop(next);
                None
            } else if next.is_completed() {
                // Refused but already resolved by the transport.
                drop(next);
                None
            } else {
                Some(next)
            };

            inner = self.inner.lock();
            if let Some(next) = refused {
                if inner.state.is_terminal() {
                    drop(inner);
                    next.failed(EndpointError::ConnectionLost);
                    drop(next);
                    inner = self.inner.lock();
                } else {
                    inner.queue.push_front(next);
                }
            }
            if !accepted {
                break;
            }
            taken += 1;
            if inner.state.is_terminal() {
                break;
            }
        }
        inner.draining = false;

        let mut transitions: Transitions = SmallVec::new();
        let mut close_now = false;
        if !inner.state.is_terminal() {
            if inner.queue.is_empty() && inner.close_requested {
                inner.state = MessengerState::Closed;
                close_now = !inner.close_sent;
                inner.close_sent = true;
                transitions.push(MessengerState::Closed);
                self.space.notify_all();
            } else if inner.state.matches(StateMask::SENDING | StateMask::SENDING_SATURATED) {
                let next = self.connected_state_for(inner.queue.len());
                if next != inner.state {
                    inner.state = next;
                    transitions.push(next);
                }
            }
        }
        if !transitions.is_empty() {
            self.core.record_transitions(&transitions);
        }
        drop(inner);

        if taken > 0 {
            trace!(messenger = self.core.id(), taken, "Drained messages");
        }
        if close_now {
            info!(messenger = self.core.id(), "Queue drained, messenger closed");
            self.transport.request_close();
        }
        self.core.deliver_pending();
        taken
    }

    /// The connection to the destination is up; leave `UNRESOLVED`.
    ///
    /// Returns `false` if already connected or terminal.
    pub fn connection_established(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.connected || inner.state.is_terminal() {
            return false;
        }
        inner.connected = true;
        if inner.state == MessengerState::Unresolved {
            let next = self.connected_state_for(inner.queue.len());
            inner.state = next;
            self.core
                .record_transitions(&[MessengerState::Resolved, next]);
        }
        drop(inner);

        info!(messenger = self.core.id(), "Connection established");
        self.core.deliver_pending();
        true
    }

    /// The underlying connection died; the messenger becomes `BROKEN`.
    ///
    /// Every still-queued message fails with "Messenger unexpectedly closed"
    /// before the transitions are published. No reconnection is attempted.
    pub fn connection_failed(&self) {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return;
        }
        let announce = match inner.state {
            MessengerState::Unresolved => MessengerState::Disconnected,
            _ if inner.close_requested => MessengerState::ReconClosing,
            _ => MessengerState::Reconnecting,
        };
        inner.state = MessengerState::Broken;
        let doomed: Vec<QueuedMessage> = inner.queue.drain(..).collect();
        self.space.notify_all();
        drop(inner);

        info!(
            messenger = self.core.id(),
            failed = doomed.len(),
            "Connection failed, messenger broken"
        );
        for queued in doomed {
            queued.failed(EndpointError::ConnectionLost);
        }
        self.core
            .record_transitions(&[announce, MessengerState::Broken]);
        self.core.deliver_pending();
    }

    /// The transport closed the connection gracefully; the messenger becomes `CLOSED`.
    ///
    /// Messages the transport already took keep their own completion; messages
    /// still queued fail as closed. `request_close` is not invoked.
    pub fn connection_close_complete(&self) {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return;
        }
        inner.state = MessengerState::Closed;
        inner.close_requested = true;
        inner.close_sent = true;
        let doomed: Vec<QueuedMessage> = inner.queue.drain(..).collect();
        self.space.notify_all();
        drop(inner);

        info!(
            messenger = self.core.id(),
            failed = doomed.len(),
            "Transport confirmed close"
        );
        for queued in doomed {
            queued.failed(EndpointError::Closed);
        }
        self.core.record_transitions(&[MessengerState::Closed]);
        self.core.deliver_pending();
    }

    fn connected_state_for(&self, queued: usize) -> MessengerState {
        if queued == 0 {
            MessengerState::Connected
        } else if queued >= self.config.queue_capacity {
            MessengerState::SendingSaturated
        } else {
            MessengerState::Sending
        }
    }

    /// Try to admit `message` while holding the queue lock
    fn admit(
        &self,
        inner: &mut MutexGuard<'_, QueueInner>,
        message: &Message,
        service: Option<&str>,
        service_param: Option<&str>,
    ) -> Admission {
        if inner.state.is_terminal() || inner.close_requested {
            return Admission::Closed;
        }
        if inner.queue.len() >= self.config.queue_capacity {
            return Admission::Overflow;
        }

        message.set_destination(self.core.destination().with_service(service, service_param));
        inner.queue.push_back(QueuedMessage::with_counters(
            message.clone(),
            service.map(ToString::to_string),
            service_param.map(ToString::to_string),
            Some(self.counters.clone()),
        ));
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);

        if inner.connected && inner.state.matches(StateMask::CONNECTED | StateMask::SENDING) {
            let next = self.connected_state_for(inner.queue.len());
            if next != inner.state {
                inner.state = next;
                self.core.record_transitions(&[next]);
            }
        }
        Admission::Accepted
    }

    fn after_admission(&self) {
        self.core.deliver_pending();
        if self.state() == MessengerState::Unresolved {
            self.resolve();
        }
    }
}

impl<T: MessengerTransport> Messenger for AsyncMessenger<T> {
    fn core(&self) -> &MessengerCore {
        &self.core
    }

    fn send_message_n(
        &self,
        message: &Message,
        service: Option<&str>,
        service_param: Option<&str>,
    ) -> bool {
        message.reset_outcome();
        let mut inner = self.inner.lock();
        let admission = self.admit(&mut inner, message, service, service_param);
        drop(inner);

        match admission {
            Admission::Accepted => {
                self.after_admission();
                true
            }
            Admission::Overflow => {
                self.counters.overflowed.fetch_add(1, Ordering::Relaxed);
                debug!(messenger = self.core.id(), message = %message.id(), "Queue full");
                message.set_outcome(SendOutcome::Overflow);
                false
            }
            Admission::Closed => {
                message.set_outcome(SendOutcome::Failed(EndpointError::Closed));
                false
            }
        }
    }

    fn send_message_b(
        &self,
        message: &Message,
        service: Option<&str>,
        service_param: Option<&str>,
    ) -> Result<()> {
        message.reset_outcome();
        let message_epoch = message.interrupt_epoch();
        let epoch = self.inner.lock().interrupts;
        self.core.register_waiter(message.waiter());

        let timeout = self.config.blocking_send_timeout;
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);

        let mut inner = self.inner.lock();
        loop {
            if inner.interrupts != epoch {
                return Err(EndpointError::io_caused_by(EndpointError::Interrupted));
            }
            match self.admit(&mut inner, message, service, service_param) {
                Admission::Accepted => break,
                Admission::Closed => {
                    drop(inner);
                    message.set_outcome(SendOutcome::Failed(EndpointError::Closed));
                    return Err(EndpointError::Closed);
                }
                Admission::Overflow => match deadline {
                    Some(deadline) => {
                        if self.space.wait_until(&mut inner, deadline).timed_out()
                            && inner.queue.len() >= self.config.queue_capacity
                        {
                            drop(inner);
                            message.set_outcome(SendOutcome::Overflow);
                            return Err(EndpointError::io_caused_by(EndpointError::Timeout {
                                duration_ms: timeout.as_millis() as u64,
                            }));
                        }
                    }
                    None => self.space.wait(&mut inner),
                },
            }
        }
        drop(inner);
        self.after_admission();

        let completion = self.config.completion_timeout;
        match message.wait_outcome_since(message_epoch, completion) {
            Ok(Some(SendOutcome::Succeeded)) => Ok(()),
            Ok(Some(SendOutcome::Failed(cause))) => Err(EndpointError::io_caused_by(cause)),
            Ok(Some(_)) => Err(EndpointError::WriteFailed),
            Ok(None) => Err(EndpointError::io_caused_by(EndpointError::Timeout {
                duration_ms: completion.as_millis() as u64,
            })),
            Err(err) => Err(EndpointError::io_caused_by(err)),
        }
    }

    fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() || inner.close_requested {
            return;
        }
        inner.close_requested = true;
        self.space.notify_all();

        if inner.queue.is_empty() && !inner.draining {
            inner.state = MessengerState::Closed;
            inner.close_sent = true;
            self.core.record_transitions(&[MessengerState::Closed]);
            drop(inner);

            info!(messenger = self.core.id(), "Messenger closed");
            self.transport.request_close();
        } else {
            inner.state = MessengerState::Closing;
            self.core.record_transitions(&[MessengerState::Closing]);
            let pending = inner.queue.len();
            drop(inner);

            info!(messenger = self.core.id(), pending, "Messenger closing");
        }
        self.core.deliver_pending();
    }

    fn resolve(&self) {
        let mut inner = self.inner.lock();
        if inner.state != MessengerState::Unresolved || inner.resolve_requested {
            return;
        }
        inner.resolve_requested = true;
        drop(inner);

        debug!(messenger = self.core.id(), "Requesting resolution");
        self.transport.request_resolve();
    }

    fn is_idle(&self) -> bool {
        let inner = self.inner.lock();
        inner.queue.is_empty() && !inner.close_requested && !inner.state.is_terminal()
    }

    fn interrupt_waiters(&self) -> usize {
        {
            let mut inner = self.inner.lock();
            inner.interrupts += 1;
            self.space.notify_all();
        }
        self.core.interrupt_waiters()
    }
}

impl<T: MessengerTransport> fmt::Debug for AsyncMessenger<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncMessenger")
            .field("core", &self.core)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
