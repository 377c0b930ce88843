//! Runtime Configuration
//!
//! Configuration for the background threads of the endpoint layer, and the
//! [`EndpointConfig`] that groups them with the messenger configuration.

use core::time::Duration;
use endpoint_core::{EndpointError, MessengerConfig};

// ----------------------------------------------------------------------------
// Bridge Configuration
// ----------------------------------------------------------------------------

/// Configuration for the legacy listener bridge
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Name of the selector thread
    pub thread_name: String,
    /// Maximum number of changed selectables handled per wake-up
    pub batch_limit: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            thread_name: "endpoint-bridge".to_string(),
            batch_limit: 64,
        }
    }
}

impl BridgeConfig {
    /// Create configuration optimized for testing
    pub fn testing() -> Self {
        Self {
            thread_name: "endpoint-bridge-test".to_string(),
            batch_limit: 4,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.thread_name.is_empty() {
            return Err("bridge.thread_name must not be empty".into());
        }
        if self.batch_limit == 0 {
            return Err("bridge.batch_limit must be greater than 0".into());
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Driver Configuration
// ----------------------------------------------------------------------------

/// Configuration for the queue driver
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// How often every watched queue is drained when nothing wakes the driver earlier
    pub poll_interval: Duration,
    /// Name of the driver thread
    pub thread_name: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            thread_name: "endpoint-driver".to_string(),
        }
    }
}

impl DriverConfig {
    /// Create configuration optimized for testing
    pub fn testing() -> Self {
        Self {
            poll_interval: Duration::from_millis(5),
            thread_name: "endpoint-driver-test".to_string(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.poll_interval.is_zero() {
            return Err("driver.poll_interval must be greater than 0".into());
        }
        if self.thread_name.is_empty() {
            return Err("driver.thread_name must not be empty".into());
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Endpoint Configuration
// ----------------------------------------------------------------------------

/// Configuration for a whole endpoint: messengers, bridge and driver
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub messenger: MessengerConfig,
    pub bridge: BridgeConfig,
    pub driver: DriverConfig,
}

impl EndpointConfig {
    /// Create a new builder for EndpointConfig
    pub fn builder() -> EndpointConfigBuilder {
        EndpointConfigBuilder::new()
    }

    /// Create configuration optimized for testing
    pub fn testing() -> Self {
        Self {
            messenger: MessengerConfig::testing(),
            bridge: BridgeConfig::testing(),
            driver: DriverConfig::testing(),
        }
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), String> {
        self.messenger
            .validate()
            .map_err(|msg| format!("messenger: {}", msg))?;
        self.bridge.validate()?;
        self.driver.validate()?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Configuration Builder
// ----------------------------------------------------------------------------

/// Builder for [`EndpointConfig`]
#[derive(Debug, Clone, Default)]
pub struct EndpointConfigBuilder {
    messenger: Option<MessengerConfig>,
    bridge: Option<BridgeConfig>,
    driver: Option<DriverConfig>,
}

impl EndpointConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set messenger configuration
    pub fn messenger(mut self, config: MessengerConfig) -> Self {
        self.messenger = Some(config);
        self
    }

    /// Set bridge configuration
    pub fn bridge(mut self, config: BridgeConfig) -> Self {
        self.bridge = Some(config);
        self
    }

    /// Set driver configuration
    pub fn driver(mut self, config: DriverConfig) -> Self {
        self.driver = Some(config);
        self
    }

    /// Use the testing preset as base (can be further customized)
    pub fn testing(self) -> Self {
        Self {
            messenger: Some(MessengerConfig::testing()),
            bridge: Some(BridgeConfig::testing()),
            driver: Some(DriverConfig::testing()),
        }
    }

    /// Build the configuration with validation
    pub fn build(self) -> Result<EndpointConfig, EndpointError> {
        let config = self.build_unchecked();
        config.validate().map_err(EndpointError::config_error)?;
        Ok(config)
    }

    /// Build the configuration without validation
    pub fn build_unchecked(self) -> EndpointConfig {
        EndpointConfig {
            messenger: self.messenger.unwrap_or_default(),
            bridge: self.bridge.unwrap_or_default(),
            driver: self.driver.unwrap_or_default(),
        }
    }
}
