//! Error types for pubsub-testkit.

use std::time::Duration;

use thiserror::Error;

/// Result type for pubsub-testkit operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for pubsub-testkit.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Storage backend error.
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Topic or subscription already exists.
    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    /// Topic not found.
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    /// Subscription not found.
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    /// Malformed ack id.
    #[error("Invalid ack id: {0}")]
    InvalidAckId(String),

    /// The emulator endpoint answered with a non-success status.
    #[error("Pub/Sub API error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error message from the response body.
        message: String,
    },

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The emulator failed to start.
    #[error("Emulator {target} failed to start: {reason}")]
    EmulatorStartup {
        /// Image reference or endpoint being started.
        target: String,
        /// Underlying cause.
        reason: String,
    },

    /// The emulator did not become ready in time.
    #[error("Emulator {target} did not become ready within {timeout:?}")]
    StartupTimeout {
        /// Image reference or endpoint being started.
        target: String,
        /// Configured startup deadline.
        timeout: Duration,
    },

    /// A wait for messages elapsed.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Validation error types.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Invalid topic ID.
    #[error("Invalid topic ID: {0}")]
    InvalidTopicId(String),

    /// Invalid subscription ID.
    #[error("Invalid subscription ID: {0}")]
    InvalidSubscriptionId(String),

    /// Invalid project ID.
    #[error("Invalid project ID: {0}")]
    InvalidProjectId(String),

    /// Invalid resource name.
    #[error("Invalid resource name: {0}")]
    InvalidResourceName(String),

    /// Message too large.
    #[error("Message too large: {size} bytes (max: {max} bytes)")]
    MessageTooLarge {
        /// Actual message size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Message has neither data nor attributes.
    #[error("Message must contain data or at least one attribute")]
    EmptyMessage,

    /// Invalid parameter.
    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter {
        /// Parameter name.
        name: String,
        /// Reason for invalidity.
        reason: String,
    },
}

impl Error {
    /// True for the not-found variants.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::TopicNotFound(_) | Error::SubscriptionNotFound(_)
        ) || matches!(self, Error::Api { status: 404, .. })
    }

    /// True when the resource being created already exists.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_)) || matches!(self, Error::Api { status: 409, .. })
    }
}
