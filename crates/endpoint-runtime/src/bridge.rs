//! Legacy Listener Bridge
//!
//! Adapts the notifier-based model of `endpoint-core` to one-shot listener
//! callbacks. Callers register interest in a *selectable* (a message awaiting
//! its send outcome, or a messenger awaiting resolution); a single selector
//! thread waits for selectables to change and invokes every pending listener
//! exactly once when its selectable can no longer change.
//!
//! ## Architecture
//!
//! ```text
//! watch_*() ──► pending table ──► hook on the selectable
//!                                      │ (state or outcome changed)
//!                                      ▼
//!                       async_channel<SelectableKey>
//!                                      │
//!                                      ▼
//!                 selector thread: check, remove, dispatch
//! ```
//!
//! Registration always enqueues the key once, so a selectable that is already
//! final when watched is still dispatched. [`LegacyListenerBridge::shutdown`]
//! gives up every pending watch with "Endpoint interface terminated".

use async_channel::{Receiver, Sender};
use endpoint_core::{
    listener, EndpointError, EndpointResult, Listener, Message, Messenger, MessengerState,
    MessengerStateListener, SendOutcome,
};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::BridgeConfig;

// ----------------------------------------------------------------------------
// Legacy Listener Contracts
// ----------------------------------------------------------------------------

/// Outcome of a watched outbound message
#[derive(Debug, Clone)]
pub struct OutgoingMessageEvent {
    message: Message,
    outcome: SendOutcome,
}

impl OutgoingMessageEvent {
    pub fn new(message: Message, outcome: SendOutcome) -> Self {
        Self { message, outcome }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn outcome(&self) -> &SendOutcome {
        &self.outcome
    }

    /// The failure that doomed the message, if it failed
    pub fn failure(&self) -> Option<&EndpointError> {
        self.outcome.failure()
    }

    /// Whether the message was refused because the queue was full
    pub fn is_overflow(&self) -> bool {
        matches!(self.outcome, SendOutcome::Overflow)
    }
}

/// Listener for the outcome of one outbound message
pub trait OutgoingMessageEventListener: Send + Sync {
    fn message_send_succeeded(&self, event: &OutgoingMessageEvent);

    /// Called on failure and on overflow
    fn message_send_failed(&self, event: &OutgoingMessageEvent);
}

/// Resolution of a watched messenger
#[derive(Clone)]
pub struct MessengerEvent {
    messenger: Option<Arc<dyn Messenger>>,
    failure: Option<EndpointError>,
}

impl MessengerEvent {
    /// The resolved messenger; `None` when resolution failed
    pub fn messenger(&self) -> Option<&Arc<dyn Messenger>> {
        self.messenger.as_ref()
    }

    pub fn failure(&self) -> Option<&EndpointError> {
        self.failure.as_ref()
    }

    pub fn is_failure(&self) -> bool {
        self.messenger.is_none()
    }
}

impl fmt::Debug for MessengerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessengerEvent")
            .field("messenger", &self.messenger.as_ref().map(|m| m.id()))
            .field("failure", &self.failure)
            .finish()
    }
}

/// Listener for the resolution of a messenger
pub trait MessengerEventListener: Send + Sync {
    /// Returns whether the listener took the messenger
    fn messenger_ready(&self, event: &MessengerEvent) -> bool;
}

// ----------------------------------------------------------------------------
// Watches
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SelectableKey {
    Message(Uuid),
    Messenger(u64),
}

enum Watch {
    Message {
        message: Message,
        hook: Listener<SendOutcome>,
        listeners: Vec<Arc<dyn OutgoingMessageEventListener>>,
        /// Attempt whose overflow was already recorded when the watch was
        /// created; the caller is expected to retry it
        stale_overflow: Option<u64>,
    },
    Messenger {
        messenger: Arc<dyn Messenger>,
        hook: MessengerStateListener,
        listeners: Vec<Arc<dyn MessengerEventListener>>,
    },
}

/// What a watch observed when its selectable became final
enum Settled {
    Message(SendOutcome),
    Messenger,
}

impl Watch {
    fn for_message(message: &Message, hook: Listener<SendOutcome>) -> Self {
        let (attempt, outcome) = message.latest_attempt();
        Watch::Message {
            message: message.clone(),
            hook,
            listeners: Vec::new(),
            stale_overflow: matches!(outcome, Some(SendOutcome::Overflow)).then_some(attempt),
        }
    }

    /// The final state of the selectable, if it can no longer change
    fn settled(&self) -> Option<Settled> {
        match self {
            Watch::Message {
                message,
                stale_overflow,
                ..
            } => {
                let (attempt, outcome) = message.latest_attempt();
                let outcome = outcome.filter(SendOutcome::is_final)?;
                if matches!(outcome, SendOutcome::Overflow) && *stale_overflow == Some(attempt) {
                    return None;
                }
                Some(Settled::Message(outcome))
            }
            Watch::Messenger { messenger, .. } => {
                (messenger.state() != MessengerState::Unresolved).then_some(Settled::Messenger)
            }
        }
    }

    fn unhook(&self) {
        match self {
            Watch::Message { message, hook, .. } => {
                message.remove_outcome_listener(hook);
            }
            Watch::Messenger {
                messenger, hook, ..
            } => {
                messenger.remove_state_listener(hook);
            }
        }
    }

    /// Invoke every listener with the selectable's final state
    fn complete(self, settled: Settled) {
        self.unhook();
        match (self, settled) {
            (
                Watch::Message {
                    message, listeners, ..
                },
                Settled::Message(outcome),
            ) => {
                let event = OutgoingMessageEvent::new(message, outcome);
                dispatch_message(&listeners, &event);
            }
            (Watch::Message { .. }, Settled::Messenger) => {}
            (
                Watch::Messenger {
                    messenger,
                    listeners,
                    ..
                },
                _,
            ) => {
                let state = messenger.state();
                let event = if state.is_usable() {
                    MessengerEvent {
                        messenger: Some(messenger),
                        failure: None,
                    }
                } else {
                    MessengerEvent {
                        messenger: None,
                        failure: Some(EndpointError::UnexpectedlyClosed),
                    }
                };
                dispatch_messenger(&listeners, &event);
            }
        }
    }

    /// Invoke every listener's failure path with "Endpoint interface terminated"
    fn give_up(self) {
        self.unhook();
        match self {
            Watch::Message {
                message, listeners, ..
            } => {
                let event = OutgoingMessageEvent::new(
                    message,
                    SendOutcome::Failed(EndpointError::Terminated),
                );
                dispatch_message(&listeners, &event);
            }
            Watch::Messenger { listeners, .. } => {
                let event = MessengerEvent {
                    messenger: None,
                    failure: Some(EndpointError::Terminated),
                };
                dispatch_messenger(&listeners, &event);
            }
        }
    }
}

fn dispatch_message(
    listeners: &[Arc<dyn OutgoingMessageEventListener>],
    event: &OutgoingMessageEvent,
) {
    let succeeded = matches!(event.outcome(), SendOutcome::Succeeded);
    for listener in listeners {
        let result = catch_unwind(AssertUnwindSafe(|| {
            if succeeded {
                listener.message_send_succeeded(event)
            } else {
                listener.message_send_failed(event)
            }
        }));
        if result.is_err() {
            warn!(message = %event.message().id(), "Message listener panicked");
        }
    }
}

fn dispatch_messenger(listeners: &[Arc<dyn MessengerEventListener>], event: &MessengerEvent) {
    for listener in listeners {
        match catch_unwind(AssertUnwindSafe(|| listener.messenger_ready(event))) {
            Ok(taken) => trace!(?event, taken, "Messenger listener invoked"),
            Err(_) => warn!(?event, "Messenger listener panicked"),
        }
    }
}

// ----------------------------------------------------------------------------
// Legacy Listener Bridge
// ----------------------------------------------------------------------------

struct BridgeShared {
    config: BridgeConfig,
    pending: Mutex<HashMap<SelectableKey, Watch>>,
    changes_tx: Sender<SelectableKey>,
    changes_rx: Receiver<SelectableKey>,
    stopped: AtomicBool,
    selector: Mutex<Option<JoinHandle<()>>>,
}

/// Bridges notifier-driven selectables to one-shot legacy listeners
pub struct LegacyListenerBridge {
    shared: Arc<BridgeShared>,
}

impl LegacyListenerBridge {
    /// Create a bridge. The selector thread starts with the first watch.
    pub fn new(config: BridgeConfig) -> EndpointResult<Self> {
        config.validate().map_err(EndpointError::config_error)?;
        let (changes_tx, changes_rx) = async_channel::unbounded();
        Ok(Self {
            shared: Arc::new(BridgeShared {
                config,
                pending: Mutex::new(HashMap::new()),
                changes_tx,
                changes_rx,
                stopped: AtomicBool::new(false),
                selector: Mutex::new(None),
            }),
        })
    }

    /// Watch `message` until its send outcome is final.
    ///
    /// Returns `false` only after shutdown, in which case `listener` is never
    /// invoked. A `None` listener registers the watch without a callback.
    pub fn watch_message(
        &self,
        listener: Option<Arc<dyn OutgoingMessageEventListener>>,
        message: &Message,
    ) -> bool {
        let key = SelectableKey::Message(message.id());
        let registered = self.shared.register(key, |tx| {
            let hook = change_hook::<SendOutcome>(tx, key);
            message.add_outcome_listener(hook.clone());
            Watch::for_message(message, hook)
        }, |watch| {
            if let (Watch::Message { listeners, .. }, Some(listener)) = (watch, listener.clone()) {
                listeners.push(listener);
            }
        });
        if registered {
            self.shared.ensure_selector();
        }
        registered
    }

    /// Watch `messenger` until it leaves `UNRESOLVED`, requesting resolution.
    ///
    /// Returns `false` only after shutdown, in which case `listener` is never
    /// invoked. A `None` listener still triggers resolution.
    pub fn watch_messenger(
        &self,
        listener: Option<Arc<dyn MessengerEventListener>>,
        messenger: Arc<dyn Messenger>,
    ) -> bool {
        let key = SelectableKey::Messenger(messenger.id());
        let registered = self.shared.register(key, |tx| {
            let hook = change_hook::<MessengerState>(tx, key);
            messenger.add_state_listener(hook.clone());
            Watch::Messenger {
                messenger: messenger.clone(),
                hook,
                listeners: Vec::new(),
            }
        }, |watch| {
            if let (Watch::Messenger { listeners, .. }, Some(listener)) = (watch, listener.clone()) {
                listeners.push(listener);
            }
        });
        if registered {
            messenger.resolve();
            self.shared.ensure_selector();
        }
        registered
    }

    /// Number of selectables still being watched
    pub fn pending_watches(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Stop the selector and give up every pending watch.
    ///
    /// Idempotent. Joins the selector thread unless called from it.
    pub fn shutdown(&self) {
        let abandoned = self.shared.stop();
        if abandoned > 0 {
            info!(abandoned, "Bridge shut down with pending watches");
        }

        let selector = self.shared.selector.lock().take();
        if let Some(handle) = selector {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("Bridge selector thread panicked");
            }
        }
    }
}

impl Drop for LegacyListenerBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for LegacyListenerBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LegacyListenerBridge")
            .field("config", &self.shared.config)
            .field("pending", &self.pending_watches())
            .field("stopped", &self.is_shut_down())
            .finish()
    }
}

/// A notifier hook that reports every change of a selectable to the selector
fn change_hook<E: 'static>(tx: Sender<SelectableKey>, key: SelectableKey) -> Listener<E> {
    listener(move |_: &E| tx.try_send(key).is_ok())
}

impl BridgeShared {
    /// Add a listener to the watch for `key`, creating the watch if needed
    fn register<C, A>(&self, key: SelectableKey, create: C, append: A) -> bool
    where
        C: FnOnce(Sender<SelectableKey>) -> Watch,
        A: FnOnce(&mut Watch),
    {
        let mut pending = self.pending.lock();
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        let watch = pending
            .entry(key)
            .or_insert_with(|| create(self.changes_tx.clone()));
        append(watch);
        drop(pending);

        // Initial check, even if the selectable is already final.
        let _ = self.changes_tx.try_send(key);
        true
    }

    /// Start the selector thread if it is not running yet
    fn ensure_selector(self: &Arc<Self>) {
        let mut selector = self.selector.lock();
        if selector.is_some() || self.stopped.load(Ordering::Acquire) {
            return;
        }
        let shared = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(self.config.thread_name.clone())
            .spawn(move || shared.run());
        match spawned {
            Ok(handle) => {
                debug!(thread = %self.config.thread_name, "Bridge selector started");
                *selector = Some(handle);
            }
            Err(e) => {
                drop(selector);
                error!("Failed to start bridge selector: {}", e);
                self.stop();
            }
        }
    }

    /// Mark the bridge stopped and give up every pending watch
    fn stop(&self) -> usize {
        let abandoned: Vec<Watch> = {
            let mut pending = self.pending.lock();
            self.stopped.store(true, Ordering::Release);
            pending.drain().map(|(_, watch)| watch).collect()
        };
        self.changes_tx.close();

        let count = abandoned.len();
        for watch in abandoned {
            watch.give_up();
        }
        count
    }

    fn run(&self) {
        if catch_unwind(AssertUnwindSafe(|| self.select_loop())).is_err() {
            error!("Bridge selector crashed; giving up pending watches");
            self.stop();
        }
        debug!("Bridge selector stopped");
    }

    fn select_loop(&self) {
        while !self.stopped.load(Ordering::Acquire) {
            let first = match self.changes_rx.recv_blocking() {
                Ok(key) => key,
                Err(_) => return,
            };

            let mut batch: SmallVec<[SelectableKey; 16]> = SmallVec::new();
            batch.push(first);
            while batch.len() < self.config.batch_limit {
                match self.changes_rx.try_recv() {
                    Ok(key) if !batch.contains(&key) => batch.push(key),
                    Ok(_) => {}
                    Err(_) => break,
                }
            }

            for key in batch {
                self.check(key);
            }
        }
    }

    /// Dispatch the watch for `key` if its selectable is final
    fn check(&self, key: SelectableKey) {
        let ready = {
            let mut pending = self.pending.lock();
            match pending.get(&key).and_then(Watch::settled) {
                Some(settled) => pending.remove(&key).map(|watch| (watch, settled)),
                None => None,
            }
        };
        if let Some((watch, settled)) = ready {
            trace!(?key, "Selectable resolved");
            watch.complete(settled);
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use endpoint_core::{
        AsyncMessenger, EndpointAddress, MessengerConfig, MessengerTransport, QueuedMessage,
    };
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct CountingListener {
        succeeded: AtomicUsize,
        failed: AtomicUsize,
        last_failure: Mutex<Option<EndpointError>>,
    }

    impl OutgoingMessageEventListener for CountingListener {
        fn message_send_succeeded(&self, _event: &OutgoingMessageEvent) {
            self.succeeded.fetch_add(1, Ordering::SeqCst);
        }

        fn message_send_failed(&self, event: &OutgoingMessageEvent) {
            *self.last_failure.lock() = event.failure().cloned();
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl CountingListener {
        fn calls(&self) -> usize {
            self.succeeded.load(Ordering::SeqCst) + self.failed.load(Ordering::SeqCst)
        }
    }

    fn wait_for(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn bridge() -> LegacyListenerBridge {
        LegacyListenerBridge::new(BridgeConfig::testing()).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = BridgeConfig {
            batch_limit: 0,
            ..BridgeConfig::default()
        };
        assert!(LegacyListenerBridge::new(config).is_err());
    }

    #[test]
    fn test_already_final_message_dispatched() {
        let bridge = bridge();
        let message = Message::new();
        QueuedMessage::new(message.clone(), None, None).succeeded();

        let listener = Arc::new(CountingListener::default());
        assert!(bridge.watch_message(Some(listener.clone()), &message));
        wait_for(|| listener.calls() == 1);
        assert_eq!(listener.succeeded.load(Ordering::SeqCst), 1);
        wait_for(|| bridge.pending_watches() == 0);
    }

    #[test]
    fn test_all_listeners_of_one_selectable_fire_once() {
        let bridge = bridge();
        let message = Message::new();
        let queued = QueuedMessage::new(message.clone(), None, None);

        let listeners: Vec<Arc<CountingListener>> =
            (0..3).map(|_| Arc::new(CountingListener::default())).collect();
        for listener in &listeners {
            assert!(bridge.watch_message(Some(listener.clone()), &message));
        }
        assert!(bridge.watch_message(None, &message));

        queued.submitted();
        queued.failed(EndpointError::WriteFailed);
        for listener in &listeners {
            wait_for(|| listener.calls() == 1);
        }
        thread::sleep(Duration::from_millis(20));
        for listener in &listeners {
            assert_eq!(listener.failed.load(Ordering::SeqCst), 1);
            assert_eq!(
                *listener.last_failure.lock(),
                Some(EndpointError::WriteFailed)
            );
        }
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        struct Panicking;
        impl OutgoingMessageEventListener for Panicking {
            fn message_send_succeeded(&self, _event: &OutgoingMessageEvent) {
                panic!("listener bug");
            }
            fn message_send_failed(&self, _event: &OutgoingMessageEvent) {
                panic!("listener bug");
            }
        }

        let bridge = bridge();
        let message = Message::new();
        let counting = Arc::new(CountingListener::default());
        bridge.watch_message(Some(Arc::new(Panicking)), &message);
        bridge.watch_message(Some(counting.clone()), &message);

        QueuedMessage::new(message.clone(), None, None).succeeded();
        wait_for(|| counting.calls() == 1);

        // The selector survived the panic.
        let second = Message::new();
        let after = Arc::new(CountingListener::default());
        assert!(bridge.watch_message(Some(after.clone()), &second));
        QueuedMessage::new(second, None, None).succeeded();
        wait_for(|| after.calls() == 1);
    }

    #[test]
    fn test_stale_overflow_waits_for_retry() {
        struct Accepting;
        impl MessengerTransport for Accepting {
            fn send_message_impl(&self, message: QueuedMessage) -> bool {
                message.submitted();
                message.succeeded();
                true
            }
            fn request_close(&self) {}
        }

        let bridge = bridge();
        let messenger = AsyncMessenger::new(
            Accepting,
            EndpointAddress::new("test", "peer-1").unwrap(),
            MessengerConfig::with_capacity(1),
        )
        .unwrap();
        assert!(messenger.send_message_n(&Message::new(), None, None));
        let retried = Message::new();
        assert!(!messenger.send_message_n(&retried, None, None));

        let listener = Arc::new(CountingListener::default());
        assert!(bridge.watch_message(Some(listener.clone()), &retried));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(listener.calls(), 0);
        assert_eq!(bridge.pending_watches(), 1);

        messenger.pull_messages();
        assert!(messenger.send_message_n(&retried, None, None));
        messenger.pull_messages();

        wait_for(|| listener.calls() == 1);
        assert_eq!(listener.succeeded.load(Ordering::SeqCst), 1);
        assert_eq!(listener.failed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_overflow_after_watch_reported_as_failure() {
        let bridge = bridge();
        let message = Message::new();
        let listener = Arc::new(CountingListener::default());
        assert!(bridge.watch_message(Some(listener.clone()), &message));

        let messenger = AsyncMessenger::new(
            NeverTakes,
            EndpointAddress::new("test", "peer-1").unwrap(),
            MessengerConfig::with_capacity(1),
        )
        .unwrap();
        messenger.send_message_n(&Message::new(), None, None);
        assert!(!messenger.send_message_n(&message, None, None));

        wait_for(|| listener.calls() == 1);
        assert_eq!(listener.failed.load(Ordering::SeqCst), 1);
        assert_eq!(*listener.last_failure.lock(), None);
    }

    struct NeverTakes;
    impl MessengerTransport for NeverTakes {
        fn send_message_impl(&self, _message: QueuedMessage) -> bool {
            false
        }
        fn request_close(&self) {}
    }

    #[test]
    fn test_shutdown_gives_up_pending_watches() {
        let bridge = bridge();
        let message = Message::new();
        let listener = Arc::new(CountingListener::default());
        assert!(bridge.watch_message(Some(listener.clone()), &message));

        bridge.shutdown();
        assert_eq!(listener.failed.load(Ordering::SeqCst), 1);
        assert_eq!(
            listener.last_failure.lock().as_ref().map(ToString::to_string),
            Some("Endpoint interface terminated".to_string())
        );
        assert_eq!(bridge.pending_watches(), 0);

        let late = Arc::new(CountingListener::default());
        assert!(!bridge.watch_message(Some(late.clone()), &Message::new()));
        bridge.shutdown();
        assert_eq!(late.calls(), 0);
    }
}
