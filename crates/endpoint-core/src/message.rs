//! Outbound Messages and Their Result Marker
//!
//! A [`Message`] is a shared handle: the caller, the delivery queue and the
//! transport all see the same message. Each submission attempt records its
//! result on the message as a [`SendOutcome`], which is what the synchronous
//! send conveniences and the legacy listener bridge inspect.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use parking_lot::{Condvar, Mutex};
use std::time::Instant;
use uuid::Uuid;

use crate::address::EndpointAddress;
use crate::errors::{EndpointError, Result};
use crate::notifier::{ChangeNotifier, Listener};
use crate::queue::QueueCounters;
use crate::waiters::Interruptible;

// ----------------------------------------------------------------------------
// Send Outcome
// ----------------------------------------------------------------------------

/// Result marker of the latest submission of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the transport, outcome pending
    Submitted,
    /// The transport reported success
    Succeeded,
    /// The queue was full; the message may be submitted again later
    Overflow,
    /// The message is doomed
    Failed(EndpointError),
}

impl SendOutcome {
    /// Whether no further change is expected for this submission
    pub fn is_final(&self) -> bool {
        !matches!(self, SendOutcome::Submitted)
    }

    /// The failure carried by this outcome
    pub fn failure(&self) -> Option<&EndpointError> {
        match self {
            SendOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Message
// ----------------------------------------------------------------------------

/// A named chunk of message content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageElement {
    pub name: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
struct MessageProps {
    destination: Option<EndpointAddress>,
    outcome: Option<SendOutcome>,
    attempts: u64,
    interrupts: u64,
}

struct MessageInner {
    id: Uuid,
    elements: Mutex<Vec<MessageElement>>,
    props: Mutex<MessageProps>,
    changed: Condvar,
    notifier: ChangeNotifier<SendOutcome>,
}

impl Interruptible for MessageInner {
    fn interrupt(&self) {
        let mut props = self.props.lock();
        props.interrupts += 1;
        self.changed.notify_all();
    }
}

/// An outbound message; clones share the same message
#[derive(Clone)]
pub struct Message {
    inner: Arc<MessageInner>,
}

impl Message {
    /// Create an empty message with a fresh id
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MessageInner {
                id: Uuid::new_v4(),
                elements: Mutex::new(Vec::new()),
                props: Mutex::new(MessageProps::default()),
                changed: Condvar::new(),
                notifier: ChangeNotifier::new(),
            }),
        }
    }

    /// Create a message holding a single element
    pub fn with_element<N: Into<String>>(name: N, data: Vec<u8>) -> Self {
        let message = Self::new();
        message.add_element(name, data);
        message
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Append an element
    pub fn add_element<N: Into<String>>(&self, name: N, data: Vec<u8>) {
        self.inner.elements.lock().push(MessageElement {
            name: name.into(),
            data,
        });
    }

    /// Data of the first element called `name`
    pub fn element(&self, name: &str) -> Option<Vec<u8>> {
        self.inner
            .elements
            .lock()
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.data.clone())
    }

    /// Snapshot of all elements, in insertion order
    pub fn elements(&self) -> Vec<MessageElement> {
        self.inner.elements.lock().clone()
    }

    /// Total payload size in bytes
    pub fn byte_len(&self) -> usize {
        self.inner.elements.lock().iter().map(|e| e.data.len()).sum()
    }

    /// Destination stamped by the latest submission
    pub fn destination(&self) -> Option<EndpointAddress> {
        self.inner.props.lock().destination.clone()
    }

    pub(crate) fn set_destination(&self, destination: EndpointAddress) {
        self.inner.props.lock().destination = Some(destination);
    }

    /// Result marker of the latest submission
    pub fn outcome(&self) -> Option<SendOutcome> {
        self.inner.props.lock().outcome.clone()
    }

    /// Number of the latest submission attempt and its marker, read together
    pub fn latest_attempt(&self) -> (u64, Option<SendOutcome>) {
        let props = self.inner.props.lock();
        (props.attempts, props.outcome.clone())
    }

    /// Clear the marker ahead of a new submission attempt
    pub(crate) fn reset_outcome(&self) {
        let mut props = self.inner.props.lock();
        props.attempts += 1;
        props.outcome = None;
    }

    /// Record `outcome`, wake blocked waiters and notify outcome listeners
    pub(crate) fn set_outcome(&self, outcome: SendOutcome) {
        self.set_outcome_unless(outcome, || false);
    }

    /// Like `set_outcome`, but leaves the marker alone if `superseded` holds
    /// when checked under the marker lock
    fn set_outcome_unless(&self, outcome: SendOutcome, superseded: impl FnOnce() -> bool) -> bool {
        {
            let mut props = self.inner.props.lock();
            if superseded() {
                return false;
            }
            props.outcome = Some(outcome.clone());
            self.inner.changed.notify_all();
        }
        self.inner.notifier.notify_new_state(&outcome);
        true
    }

    /// Register a listener for result-marker changes
    pub fn add_outcome_listener(&self, listener: Listener<SendOutcome>) -> bool {
        self.inner.notifier.add_listener(listener)
    }

    /// Unregister a result-marker listener
    pub fn remove_outcome_listener(&self, listener: &Listener<SendOutcome>) -> bool {
        self.inner.notifier.remove_listener(listener)
    }

    /// Block until the marker is final, or `timeout` elapses (zero waits forever).
    ///
    /// Returns `Ok(None)` on timeout.
    pub fn wait_outcome(&self, timeout: Duration) -> Result<Option<SendOutcome>> {
        let epoch = self.interrupt_epoch();
        self.wait_outcome_since(epoch, timeout)
    }

    pub(crate) fn interrupt_epoch(&self) -> u64 {
        self.inner.props.lock().interrupts
    }

    /// Like `wait_outcome`, but also fails for interrupts issued after `epoch`
    /// was read, even if they landed before this call started waiting.
    pub(crate) fn wait_outcome_since(
        &self,
        epoch: u64,
        timeout: Duration,
    ) -> Result<Option<SendOutcome>> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let mut props = self.inner.props.lock();

        loop {
            if let Some(outcome) = props.outcome.as_ref().filter(|o| o.is_final()) {
                return Ok(Some(outcome.clone()));
            }
            if props.interrupts != epoch {
                return Err(EndpointError::Interrupted);
            }
            match deadline {
                Some(deadline) => {
                    if self.inner.changed.wait_until(&mut props, deadline).timed_out() {
                        return Ok(props.outcome.clone().filter(SendOutcome::is_final));
                    }
                }
                None => self.inner.changed.wait(&mut props),
            }
        }
    }

    /// Whether both handles refer to the same message
    pub fn same_message(&self, other: &Message) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn waiter(&self) -> Arc<dyn Interruptible> {
        self.inner.clone()
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.inner.id)
            .field("bytes", &self.byte_len())
            .field("outcome", &self.outcome())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Queued Message
// ----------------------------------------------------------------------------

struct QueuedInner {
    message: Message,
    service: Option<String>,
    service_param: Option<String>,
    submitted: AtomicBool,
    completed: AtomicBool,
    counters: Option<Arc<QueueCounters>>,
}

impl Drop for QueuedInner {
    fn drop(&mut self) {
        // Dropped by the transport without an outcome.
        if !self.completed.swap(true, Ordering::AcqRel) {
            if let Some(counters) = &self.counters {
                counters.record_failed();
            }
            self.message
                .set_outcome(SendOutcome::Failed(EndpointError::WriteFailed));
        }
    }
}

/// A message held by a delivery queue, paired with its completion listener.
///
/// `succeeded` and `failed` are one-shot and mutually exclusive. A queued
/// message dropped without either is failed with "Failed to write message".
#[derive(Clone)]
pub struct QueuedMessage {
    inner: Arc<QueuedInner>,
}

impl QueuedMessage {
    /// Pair `message` with a completion listener
    pub fn new(message: Message, service: Option<String>, service_param: Option<String>) -> Self {
        Self::with_counters(message, service, service_param, None)
    }

    pub(crate) fn with_counters(
        message: Message,
        service: Option<String>,
        service_param: Option<String>,
        counters: Option<Arc<QueueCounters>>,
    ) -> Self {
        Self {
            inner: Arc::new(QueuedInner {
                message,
                service,
                service_param,
                submitted: AtomicBool::new(false),
                completed: AtomicBool::new(false),
                counters,
            }),
        }
    }

    pub fn message(&self) -> &Message {
        &self.inner.message
    }

    pub fn service(&self) -> Option<&str> {
        self.inner.service.as_deref()
    }

    pub fn service_param(&self) -> Option<&str> {
        self.inner.service_param.as_deref()
    }

    /// The transport took the message. Ignored after completion or a second call.
    pub fn submitted(&self) -> bool {
        if self.inner.submitted.swap(true, Ordering::AcqRel) {
            return false;
        }
        // A completion racing in from another thread swaps `completed` before
        // taking the marker lock, so it is either seen here or lands after.
        let completed = &self.inner.completed;
        self.inner
            .message
            .set_outcome_unless(SendOutcome::Submitted, || completed.load(Ordering::Acquire))
    }

    /// The transport delivered the message. Returns `false` if already completed.
    pub fn succeeded(&self) -> bool {
        if self.inner.completed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(counters) = &self.inner.counters {
            counters.record_delivered();
        }
        self.inner.message.set_outcome(SendOutcome::Succeeded);
        true
    }

    /// The transport failed the message. Returns `false` if already completed.
    pub fn failed(&self, cause: EndpointError) -> bool {
        if self.inner.completed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(counters) = &self.inner.counters {
            counters.record_failed();
        }
        self.inner.message.set_outcome(SendOutcome::Failed(cause));
        true
    }

    /// Whether `succeeded` or `failed` already fired
    pub fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for QueuedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedMessage")
            .field("message", &self.inner.message.id())
            .field("service", &self.inner.service)
            .field("service_param", &self.inner.service_param)
            .field("completed", &self.is_completed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
