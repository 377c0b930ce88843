//! Endpoint Runtime
//!
//! Background threads of the endpoint layer:
//! - [`LegacyListenerBridge`]: one selector thread turning message outcomes and
//!   messenger resolution into one-shot legacy listener callbacks
//! - [`QueueDriver`]: one thread draining delivery queues for transports that
//!   have no driver of their own
//!
//! `endpoint-core` provides the messenger and queue these threads act on.

pub mod bridge;
pub mod config;
pub mod driver;

pub use bridge::{
    LegacyListenerBridge, MessengerEvent, MessengerEventListener, OutgoingMessageEvent,
    OutgoingMessageEventListener,
};
pub use config::{BridgeConfig, DriverConfig, EndpointConfig, EndpointConfigBuilder};
pub use driver::{Drainable, QueueDriver};

// Re-export core types for convenience
pub use endpoint_core::{
    AsyncMessenger, EndpointAddress, EndpointError, EndpointResult, Message, Messenger,
    MessengerConfig, MessengerState, MessengerTransport, QueuedMessage, SendOutcome, StateMask,
};
