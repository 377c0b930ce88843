//! Endpoint Messenger Core
//!
//! This crate provides the messenger abstraction of the overlay endpoint layer:
//! a per-destination logical connection with an observable lifecycle, and the
//! bounded asynchronous delivery queue that transports build on.
//!
//! - [`MessengerState`] / [`StateMask`]: lifecycle vocabulary and wait masks
//! - [`Messenger`] / [`MessengerCore`]: the base contract and its shared state
//! - [`AsyncMessenger`] / [`MessengerTransport`]: the queue and the transport hooks
//! - [`Message`] / [`QueuedMessage`]: outbound messages and their result marker
//! - [`ChangeNotifier`] / [`StateBarrier`]: listener fan-out and one-shot waits

extern crate alloc;

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod address;
pub mod barrier;
pub mod config;
pub mod errors;
pub mod message;
pub mod messenger;
pub mod notifier;
pub mod queue;
pub mod state;
pub mod waiters;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use address::EndpointAddress;
pub use barrier::StateBarrier;
pub use config::MessengerConfig;
pub use errors::{EndpointError, EndpointResult, Result};
pub use message::{Message, MessageElement, QueuedMessage, SendOutcome};
pub use messenger::{Messenger, MessengerCore};
pub use notifier::{listener, ChangeNotifier, Listener, MessengerStateListener, StateChangeNotifier};
pub use queue::{AsyncMessenger, MessengerTransport, QueueStats};
pub use state::{MessengerState, StateMask};
pub use waiters::Interruptible;
