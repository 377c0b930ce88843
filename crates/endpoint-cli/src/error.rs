//! Error handling for the endpoint CLI

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Endpoint error: {0}")]
    Endpoint(#[from] endpoint_core::EndpointError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration loading error: {0}")]
    Figment(#[from] figment::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Demo failed: {0}")]
    Demo(String),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
