//! Error handling for the messaging layer.

use std::time::Duration;

use thiserror::Error;

/// The main result type used throughout the messaging layer.
pub type MessagingResult<T> = Result<T, MessagingError>;

/// Error type for all messaging operations.
#[derive(Error, Debug)]
pub enum MessagingError {
    /// A waiter is already registered for this correlation id.
    #[error("Duplicate correlation id: {correlation_id}")]
    DuplicateKey { correlation_id: String },

    /// No response arrived before the deadline.
    #[error("Request {correlation_id} timed out after {duration:?}")]
    TimedOut {
        correlation_id: String,
        duration: Duration,
    },

    /// The provider was closed while the operation was in flight.
    #[error("Messaging provider closed")]
    Closed,

    /// Outbound traffic attempted after the provider was closed.
    #[error("Channel closed")]
    ChannelClosed,

    /// The last known credential expired and no refresh has succeeded since.
    #[error("Credential expired")]
    CredentialExpired,

    /// A superseded operation that this provider does not implement.
    #[error("Operation not supported: {operation}")]
    NotSupported { operation: &'static str },

    /// Too many outstanding requests.
    #[error("Capacity exceeded: {message}")]
    CapacityExceeded { message: String },

    /// The provider has not been initialized yet.
    #[error("Messaging provider not initialized")]
    NotInitialized,

    /// The token supplier failed or no credential is available.
    #[error("Authentication error: {message}")]
    Auth { message: String },

    /// The underlying channel failed to connect or send.
    #[error("Channel error: {message}")]
    Channel { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MessagingError {
    /// Create a duplicate key error.
    pub fn duplicate_key(correlation_id: impl Into<String>) -> Self {
        Self::DuplicateKey {
            correlation_id: correlation_id.into(),
        }
    }

    /// Create a timeout error.
    pub fn timed_out(correlation_id: impl Into<String>, duration: Duration) -> Self {
        Self::TimedOut {
            correlation_id: correlation_id.into(),
            duration,
        }
    }

    /// Create a not-supported error for a legacy operation.
    pub fn not_supported(operation: &'static str) -> Self {
        Self::NotSupported { operation }
    }

    /// Create a capacity exceeded error.
    pub fn capacity_exceeded(message: impl Into<String>) -> Self {
        Self::CapacityExceeded {
            message: message.into(),
        }
    }

    /// Create an authentication error.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Create a channel error.
    pub fn channel(message: impl Into<String>) -> Self {
        Self::Channel {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns true if the error is terminal for the provider (closed or channel closed).
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed | Self::ChannelClosed)
    }
}
