//! Loopback Demonstration
//!
//! Runs one messenger over an in-process loopback transport, drained by a
//! [`QueueDriver`] and observed through a [`LegacyListenerBridge`], and reports
//! how each message ended.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use endpoint_core::{
    listener, AsyncMessenger, EndpointAddress, EndpointError, Message, Messenger, MessengerState,
    MessengerTransport, QueueStats, QueuedMessage,
};
use endpoint_runtime::{
    EndpointConfig, LegacyListenerBridge, MessengerEvent, MessengerEventListener,
    OutgoingMessageEvent, OutgoingMessageEventListener, QueueDriver,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{CliError, Result};

const LOOPBACK_ADDRESS: &str = "loop://localhost/EndpointService";

// ----------------------------------------------------------------------------
// Demo Options and Report
// ----------------------------------------------------------------------------

/// Parameters of a demo run
#[derive(Debug, Clone)]
pub struct DemoOptions {
    /// Overrides the configured queue capacity
    pub capacity: Option<usize>,
    pub messages: usize,
    /// Messages taken after the first `fail_after` fail
    pub fail_after: Option<usize>,
    /// How long to wait for every outcome to be reported
    pub deadline: Duration,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            capacity: None,
            messages: 50,
            fail_after: None,
            deadline: Duration::from_secs(30),
        }
    }
}

/// What happened to the messages of a demo run
#[derive(Debug, Clone)]
pub struct DemoReport {
    pub sent: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub transitions: Vec<MessengerState>,
    pub stats: QueueStats,
}

// ----------------------------------------------------------------------------
// Loopback Transport
// ----------------------------------------------------------------------------

/// Delivers messages to nowhere, optionally failing all but the first few
struct LoopbackTransport {
    fail_after: Option<usize>,
    taken: AtomicUsize,
}

impl MessengerTransport for LoopbackTransport {
    fn send_message_impl(&self, message: QueuedMessage) -> bool {
        let seq = self.taken.fetch_add(1, Ordering::SeqCst);
        message.submitted();
        match self.fail_after {
            Some(limit) if seq >= limit => {
                message.failed(EndpointError::runtime("loopback link dropped the message"));
            }
            _ => {
                message.succeeded();
            }
        }
        true
    }

    fn request_close(&self) {
        info!("Loopback link closed");
    }

    fn request_resolve(&self) {
        debug!("Loopback resolution requested");
    }

    fn local_address(&self) -> Option<EndpointAddress> {
        LOOPBACK_ADDRESS.parse().ok()
    }
}

// ----------------------------------------------------------------------------
// Legacy Listeners
// ----------------------------------------------------------------------------

#[derive(Default)]
struct Tally {
    succeeded: AtomicUsize,
    failed: AtomicUsize,
}

impl Tally {
    fn total(&self) -> usize {
        self.succeeded.load(Ordering::SeqCst) + self.failed.load(Ordering::SeqCst)
    }
}

impl OutgoingMessageEventListener for Tally {
    fn message_send_succeeded(&self, _event: &OutgoingMessageEvent) {
        self.succeeded.fetch_add(1, Ordering::SeqCst);
    }

    fn message_send_failed(&self, event: &OutgoingMessageEvent) {
        debug!(message = %event.message().id(), failure = ?event.failure(), "Message failed");
        self.failed.fetch_add(1, Ordering::SeqCst);
    }
}

struct ReadyLogger;

impl MessengerEventListener for ReadyLogger {
    fn messenger_ready(&self, event: &MessengerEvent) -> bool {
        match event.messenger() {
            Some(messenger) => {
                info!(
                    messenger = messenger.id(),
                    destination = %messenger.destination_address(),
                    "Messenger resolved"
                );
                true
            }
            None => {
                warn!(failure = ?event.failure(), "Messenger resolution failed");
                false
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Demo Run
// ----------------------------------------------------------------------------

/// Run the loopback demo
pub fn run_demo(config: &EndpointConfig, options: &DemoOptions) -> Result<DemoReport> {
    let mut messenger_config = config.messenger.clone();
    if let Some(capacity) = options.capacity {
        messenger_config.queue_capacity = capacity;
    }

    let driver = QueueDriver::start(config.driver.clone())?;
    let bridge = LegacyListenerBridge::new(config.bridge.clone())?;

    let destination: EndpointAddress = LOOPBACK_ADDRESS.parse()?;
    let messenger = Arc::new(AsyncMessenger::unresolved(
        LoopbackTransport {
            fail_after: options.fail_after,
            taken: AtomicUsize::new(0),
        },
        destination,
        messenger_config,
    )?);
    let transitions = Arc::new(Mutex::new(Vec::new()));
    {
        let recorder = transitions.clone();
        let id = messenger.id();
        messenger.add_state_listener(listener(move |state: &MessengerState| {
            info!(messenger = id, "State -> {}", state);
            recorder.lock().push(*state);
            true
        }));
    }

    bridge.watch_messenger(Some(Arc::new(ReadyLogger)), messenger.clone());
    messenger.connection_established();
    if let Some(local) = messenger.local_address() {
        debug!(local = %local, "Loopback link up");
    }
    driver.watch(messenger.clone());

    let tally = Arc::new(Tally::default());
    for seq in 0..options.messages {
        let message = Message::with_element("seq", seq.to_be_bytes().to_vec());
        bridge.watch_message(Some(tally.clone()), &message);
        if let Err(e) = messenger.send_message_b(&message, Some("demo"), None) {
            debug!(seq, "Blocking send failed: {}", e);
        }
    }

    messenger.close();
    messenger.flush()?;

    let deadline = Instant::now() + options.deadline;
    while tally.total() < options.messages {
        if Instant::now() >= deadline {
            return Err(CliError::Demo(format!(
                "only {} of {} outcomes reported",
                tally.total(),
                options.messages
            )));
        }
        thread::sleep(Duration::from_millis(5));
    }

    bridge.shutdown();
    driver.stop();

    let report = DemoReport {
        sent: options.messages,
        succeeded: tally.succeeded.load(Ordering::SeqCst),
        failed: tally.failed.load(Ordering::SeqCst),
        transitions: transitions.lock().clone(),
        stats: messenger.stats(),
    };
    info!(
        succeeded = report.succeeded,
        failed = report.failed,
        "Demo finished"
    );
    Ok(report)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
