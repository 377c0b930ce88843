//! Queue Driver
//!
//! A background thread that drains delivery queues for transports without a
//! thread of their own. Every watched messenger is drained once per poll
//! interval, and immediately when it reports new traffic or a pending close.

use core::time::Duration;
use endpoint_core::{
    listener, AsyncMessenger, EndpointError, EndpointResult, Messenger, MessengerState,
    MessengerTransport, StateMask,
};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, trace};

use crate::config::DriverConfig;

/// A messenger whose queue the driver can drain
pub trait Drainable: Messenger {
    /// Hand queued messages to the transport; returns how many were taken
    fn pull_messages(&self) -> usize;
}

impl<T: MessengerTransport> Drainable for AsyncMessenger<T> {
    fn pull_messages(&self) -> usize {
        AsyncMessenger::pull_messages(self)
    }
}

#[derive(Default)]
struct DriverShared {
    messengers: Mutex<Vec<Arc<dyn Drainable>>>,
    wake: Mutex<bool>,
    woken: Condvar,
    stopped: AtomicBool,
}

impl DriverShared {
    fn wake(&self) {
        let mut wake = self.wake.lock();
        *wake = true;
        self.woken.notify_one();
    }

    /// Drain every watched queue once, forgetting terminal messengers
    fn drain_all(&self) -> usize {
        let snapshot: Vec<Arc<dyn Drainable>> = self.messengers.lock().clone();
        let taken = snapshot.iter().map(|m| m.pull_messages()).sum();
        self.messengers.lock().retain(|m| !m.state().is_terminal());
        taken
    }

    fn run(&self, poll_interval: Duration) {
        while !self.stopped.load(Ordering::Acquire) {
            let taken = self.drain_all();
            if taken > 0 {
                trace!(taken, "Driver pass");
            }

            let mut wake = self.wake.lock();
            if !*wake && !self.stopped.load(Ordering::Acquire) {
                let _ = self.woken.wait_for(&mut wake, poll_interval);
            }
            *wake = false;
        }
        debug!("Queue driver stopped");
    }
}

/// Background thread draining a set of messengers
pub struct QueueDriver {
    config: DriverConfig,
    shared: Arc<DriverShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl QueueDriver {
    /// Start the driver thread
    pub fn start(config: DriverConfig) -> EndpointResult<Self> {
        config.validate().map_err(EndpointError::config_error)?;
        let shared = Arc::new(DriverShared::default());

        let thread_shared = shared.clone();
        let poll_interval = config.poll_interval;
        let handle = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || thread_shared.run(poll_interval))
            .map_err(|e| EndpointError::runtime(format!("failed to start queue driver: {}", e)))?;

        debug!(thread = %config.thread_name, ?poll_interval, "Queue driver started");
        Ok(Self {
            config,
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Start draining `messenger`.
    ///
    /// Returns `false` if the driver is stopped or the messenger is terminal.
    pub fn watch(&self, messenger: Arc<dyn Drainable>) -> bool {
        if self.shared.stopped.load(Ordering::Acquire) || messenger.state().is_terminal() {
            return false;
        }

        let driver: Weak<DriverShared> = Arc::downgrade(&self.shared);
        messenger.add_state_listener(listener(move |state: &MessengerState| {
            let Some(driver) = driver.upgrade() else {
                return false;
            };
            if driver.stopped.load(Ordering::Acquire) {
                return false;
            }
            if state.matches(StateMask::SENDING | StateMask::SENDING_SATURATED | StateMask::CLOSING)
            {
                driver.wake();
            }
            !state.is_terminal()
        }));

        self.shared.messengers.lock().push(messenger);
        self.shared.wake();
        true
    }

    /// Number of messengers currently drained
    pub fn watched(&self) -> usize {
        self.shared.messengers.lock().len()
    }

    pub fn is_running(&self) -> bool {
        !self.shared.stopped.load(Ordering::Acquire)
    }

    /// Stop the thread and wait for it to exit. Idempotent.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.wake();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        self.shared.messengers.lock().clear();
    }
}

impl Drop for QueueDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for QueueDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueDriver")
            .field("config", &self.config)
            .field("watched", &self.watched())
            .field("running", &self.is_running())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use endpoint_core::{EndpointAddress, Message, MessengerConfig, QueuedMessage};
    use std::time::Instant;

    struct Immediate;

    impl MessengerTransport for Immediate {
        fn send_message_impl(&self, message: QueuedMessage) -> bool {
            message.succeeded();
            true
        }

        fn request_close(&self) {}
    }

    fn messenger() -> Arc<AsyncMessenger<Immediate>> {
        let destination = EndpointAddress::new("loop", "self").unwrap();
        Arc::new(AsyncMessenger::new(Immediate, destination, MessengerConfig::testing()).unwrap())
    }

    fn slow_config() -> DriverConfig {
        DriverConfig {
            poll_interval: Duration::from_secs(60),
            ..DriverConfig::testing()
        }
    }

    #[test]
    fn test_traffic_wakes_driver() {
        let driver = QueueDriver::start(slow_config()).unwrap();
        let m = messenger();
        assert!(driver.watch(m.clone()));

        let message = Message::new();
        assert!(m.send_message_n(&message, None, None));
        let deadline = Instant::now() + Duration::from_secs(5);
        while m.queued() > 0 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(m.flush(), Ok(()));
        driver.stop();
    }

    #[test]
    fn test_close_completes_through_driver() {
        let driver = QueueDriver::start(DriverConfig::testing()).unwrap();
        let m = messenger();
        for _ in 0..3 {
            m.send_message_n(&Message::new(), None, None);
        }
        m.close();
        assert!(driver.watch(m.clone()));

        let state = m
            .wait_state(StateMask::TERMINAL, Duration::from_secs(5))
            .unwrap();
        assert_eq!(state, MessengerState::Closed);
    }

    #[test]
    fn test_stopped_driver_refuses_watches() {
        let driver = QueueDriver::start(DriverConfig::testing()).unwrap();
        driver.stop();
        driver.stop();
        assert!(!driver.is_running());
        assert!(!driver.watch(messenger()));
    }

    #[test]
    fn test_terminal_messengers_are_forgotten() {
        let driver = QueueDriver::start(DriverConfig::testing()).unwrap();
        let m = messenger();
        driver.watch(m.clone());
        m.close();

        let deadline = Instant::now() + Duration::from_secs(5);
        while driver.watched() > 0 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(2));
        }
    }
}
