//! Error types for the endpoint messaging layer
//!
//! One error type covers the whole core. It is `Clone` because a single
//! messenger-scoped failure is fanned out to every message still queued.

use alloc::boxed::Box;
use alloc::string::{String, ToString};

// ----------------------------------------------------------------------------
// Endpoint Error
// ----------------------------------------------------------------------------

/// Core error type for messengers and their delivery queues
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    /// Generic I/O failure, optionally carrying the failure that caused it
    #[error("{message}")]
    Io {
        message: String,
        #[source]
        cause: Option<Box<EndpointError>>,
    },

    /// Submission to a messenger that is closed or closing
    #[error("Messenger is closed. It cannot be used to send messages")]
    Closed,

    /// The connection died while messages were still queued
    #[error("Messenger unexpectedly closed")]
    ConnectionLost,

    /// A flush ended in a state that is neither closed nor usable
    #[error("Messenger was unexpectedly closed.")]
    UnexpectedlyClosed,

    /// The transport reported a failure without a cause
    #[error("Failed to write message")]
    WriteFailed,

    /// The legacy listener bridge shut down before the event happened
    #[error("Endpoint interface terminated")]
    Terminated,

    /// A blocked waiter was interrupted
    #[error("Interrupted while waiting")]
    Interrupted,

    /// A bounded wait elapsed
    #[error("Timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Unchecked failure raised by a transport
    #[error("Transport failure: {reason}")]
    Runtime { reason: String },

    /// Unrecoverable failure raised by a transport
    #[error("Fatal failure: {reason}")]
    Fatal { reason: String },

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// Endpoint address could not be parsed
    #[error("Invalid endpoint address: {reason}")]
    InvalidAddress { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl EndpointError {
    /// Create an I/O error with a message
    pub fn io<T: Into<String>>(message: T) -> Self {
        EndpointError::Io {
            message: message.into(),
            cause: None,
        }
    }

    /// Create an I/O error that wraps `cause`, reusing its text as the message
    pub fn io_caused_by(cause: EndpointError) -> Self {
        EndpointError::Io {
            message: cause.to_string(),
            cause: Some(Box::new(cause)),
        }
    }

    /// Create an unchecked transport failure
    pub fn runtime<T: Into<String>>(reason: T) -> Self {
        EndpointError::Runtime {
            reason: reason.into(),
        }
    }

    /// Create a fatal transport failure
    pub fn fatal<T: Into<String>>(reason: T) -> Self {
        EndpointError::Fatal {
            reason: reason.into(),
        }
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        EndpointError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create an address parsing error with a reason
    pub fn invalid_address<T: Into<String>>(reason: T) -> Self {
        EndpointError::InvalidAddress {
            reason: reason.into(),
        }
    }

    /// Whether this error belongs to the I/O failure kind
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            EndpointError::Io { .. }
                | EndpointError::Closed
                | EndpointError::ConnectionLost
                | EndpointError::UnexpectedlyClosed
                | EndpointError::WriteFailed
                | EndpointError::Terminated
        )
    }

    /// The wrapped cause of an I/O error, if any
    pub fn cause(&self) -> Option<&EndpointError> {
        match self {
            EndpointError::Io { cause, .. } => cause.as_deref(),
            _ => None,
        }
    }

    /// Whether this error is, or was caused by, an interruption
    pub fn is_interrupted(&self) -> bool {
        match self {
            EndpointError::Interrupted => true,
            other => other.cause().is_some_and(EndpointError::is_interrupted),
        }
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, EndpointError>;
pub type EndpointResult<T> = Result<T>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
