//! Error types for Conveyor
//!
//! This module defines the crate-wide error enum, the `Result` alias, and the
//! listener-failure value type that flows through the error-handler pipeline
//! and dead-letter routing.

use std::fmt;
use thiserror::Error;

/// Result type alias for Conveyor operations
pub type Result<T> = std::result::Result<T, ConveyorError>;

/// Error class reported for records that could not be decoded.
///
/// Such records reach the listener as a `None` value plus a
/// deserialization-error header; handlers treat this class as
/// non-retryable.
pub const DESERIALIZATION_ERROR_CLASS: &str = "DeserializationError";

/// Main error type for Conveyor
#[derive(Error, Debug)]
pub enum ConveyorError {
    #[error("Consumer creation failed: {0}")]
    ConsumerCreation(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Authorization failed: {0}")]
    AuthorizationFailed(String),

    #[error("Transient broker error: {0}")]
    TransientBroker(String),

    #[error("Consumer woken up")]
    Wakeup,

    #[error("Producer fenced: {0}")]
    ProducerFenced(String),

    #[error("No transactional producer available after {waited_ms} ms")]
    NoProducerAvailable { waited_ms: u64 },

    #[error("Offset commit failed after {attempts} attempts: {message}")]
    CommitFailed { attempts: u32, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Illegal container state: {0}")]
    IllegalState(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Dead-letter publish failed: {0}")]
    DeadLetterPublish(String),

    #[error("No destination registered for topic: {0}")]
    UnknownDestination(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Rebalance callback failed: {0}")]
    Rebalance(String),

    #[error("Listener failed: {0}")]
    Listener(ListenerError),
}

impl ConveyorError {
    /// Whether the poll loop should sleep briefly and retry
    pub fn is_transient(&self) -> bool {
        matches!(self, ConveyorError::TransientBroker(_))
    }

    /// Whether the cause is an authentication or authorization failure
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            ConveyorError::AuthenticationFailed(_) | ConveyorError::AuthorizationFailed(_)
        )
    }

    /// Whether a transactional producer was fenced by a newer epoch
    pub fn is_fenced(&self) -> bool {
        matches!(self, ConveyorError::ProducerFenced(_))
    }

    /// Whether this is the wakeup signal raised by `Consumer::wakeup`
    pub fn is_wakeup(&self) -> bool {
        matches!(self, ConveyorError::Wakeup)
    }
}

/// A failure raised by user listener code.
///
/// Listener failures are values, not panics. The `class` identifier is the
/// key used by error classifiers and by exception-matched dead-letter topic
/// routing; the message and capture are carried into retry headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerError {
    class: String,
    message: String,
    capture: Option<String>,
}

impl ListenerError {
    /// Create a new listener error with a class identifier and message
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
            capture: None,
        }
    }

    /// Attach a captured rendering of the underlying failure (stack trace
    /// analog carried into the `x-retry-exception-stacktrace` header)
    pub fn with_capture(mut self, capture: impl Into<String>) -> Self {
        self.capture = Some(capture.into());
        self
    }

    /// Build a listener error from any error value, using its type name as
    /// the class identifier
    pub fn from_error<E: std::error::Error>(error: &E) -> Self {
        Self {
            class: std::any::type_name::<E>()
                .rsplit("::")
                .next()
                .unwrap_or("UnknownError")
                .to_string(),
            message: error.to_string(),
            capture: Some(format!("{error:?}")),
        }
    }

    /// The error-class identifier used for classification and DLT routing
    pub fn class(&self) -> &str {
        &self.class
    }

    /// The failure message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The captured failure rendering, if any
    pub fn capture(&self) -> Option<&str> {
        self.capture.as_deref()
    }

    /// Whether this failure reports an undecodable record
    pub fn is_deserialization(&self) -> bool {
        self.class == DESERIALIZATION_ERROR_CLASS
    }
}

impl fmt::Display for ListenerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

impl std::error::Error for ListenerError {}

impl From<ListenerError> for ConveyorError {
    fn from(error: ListenerError) -> Self {
        ConveyorError::Listener(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_error_class_and_message() {
        let error = ListenerError::new("IllegalStateException", "boom");
        assert_eq!(error.class(), "IllegalStateException");
        assert_eq!(error.message(), "boom");
        assert!(error.capture().is_none());
        assert_eq!(error.to_string(), "IllegalStateException: boom");
    }

    #[test]
    fn test_listener_error_from_error_uses_type_name() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let error = ListenerError::from_error(&io);
        assert_eq!(error.class(), "Error");
        assert_eq!(error.message(), "disk gone");
        assert!(error.capture().is_some());
    }

    #[test]
    fn test_error_predicates() {
        assert!(ConveyorError::TransientBroker("metadata refresh".into()).is_transient());
        assert!(ConveyorError::AuthenticationFailed("sasl".into()).is_auth());
        assert!(ConveyorError::AuthorizationFailed("acl".into()).is_auth());
        assert!(ConveyorError::ProducerFenced("epoch 4".into()).is_fenced());
        assert!(ConveyorError::Wakeup.is_wakeup());
        assert!(!ConveyorError::Wakeup.is_transient());
    }

    #[test]
    fn test_deserialization_class() {
        let error = ListenerError::new(DESERIALIZATION_ERROR_CLASS, "bad payload");
        assert!(error.is_deserialization());
        assert!(!ListenerError::new("Other", "x").is_deserialization());
    }
}
