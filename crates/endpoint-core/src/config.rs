//! Messenger Configuration
//!
//! Tunables for [`AsyncMessenger`](crate::queue::AsyncMessenger). A zero
//! duration always means "wait forever".

use alloc::string::String;
use core::time::Duration;

// ----------------------------------------------------------------------------
// Messenger Configuration
// ----------------------------------------------------------------------------

/// Configuration for a messenger's delivery queue and blocking operations
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct MessengerConfig {
    /// Maximum number of messages held by the delivery queue
    pub queue_capacity: usize,
    /// Bound on how long `send_message_b` waits for queue space (zero waits forever)
    pub blocking_send_timeout: Duration,
    /// Bound on how long `send_message_b` waits for the transport outcome (zero waits forever)
    pub completion_timeout: Duration,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            blocking_send_timeout: Duration::ZERO,
            completion_timeout: Duration::ZERO,
        }
    }
}

impl MessengerConfig {
    /// Create a configuration with the given queue capacity and default timeouts
    pub fn with_capacity(queue_capacity: usize) -> Self {
        Self {
            queue_capacity,
            ..Self::default()
        }
    }

    /// Create configuration for low-memory environments
    pub fn low_memory() -> Self {
        Self {
            queue_capacity: 16,
            blocking_send_timeout: Duration::from_secs(30),
            completion_timeout: Duration::from_secs(60),
        }
    }

    /// Create configuration for high-throughput environments
    pub fn high_throughput() -> Self {
        Self {
            queue_capacity: 1024,
            blocking_send_timeout: Duration::ZERO,
            completion_timeout: Duration::ZERO,
        }
    }

    /// Create configuration optimized for testing (small queue, bounded waits)
    pub fn testing() -> Self {
        Self {
            queue_capacity: 10,
            blocking_send_timeout: Duration::from_secs(5),
            completion_timeout: Duration::from_secs(5),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be greater than 0".into());
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
