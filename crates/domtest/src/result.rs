//! Result and error types for domtest.

use crate::protocol::TestId;
use thiserror::Error;

/// Result type for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Errors that can occur in the harness
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Coordinator/runtime invariant broken by a message or subscription
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// DOM helper failure (missing element, wrong element kind, query count)
    #[error("{message}")]
    Dom {
        /// Error message
        message: String,
    },

    /// Markup could not be parsed into a document
    #[error("Markup error at byte {position}: {message}")]
    Markup {
        /// Byte offset into the markup
        position: usize,
        /// Error message
        message: String,
    },

    /// Isolated context could not be created
    #[error("Failed to launch context for {id}: {message}")]
    Launch {
        /// Test id
        id: TestId,
        /// Error message
        message: String,
    },

    /// Assertion raised by test logic
    #[error("{message}")]
    Assertion {
        /// Error message
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
}

impl HarnessError {
    /// Create a DOM error
    #[must_use]
    pub fn dom(message: impl Into<String>) -> Self {
        Self::Dom {
            message: message.into(),
        }
    }

    /// Create an assertion error
    #[must_use]
    pub fn assertion(message: impl Into<String>) -> Self {
        Self::Assertion {
            message: message.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a launch error
    #[must_use]
    pub fn launch(id: TestId, message: impl Into<String>) -> Self {
        Self::Launch {
            id,
            message: message.into(),
        }
    }

    /// Whether this error signals a harness bug rather than a test failure
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }
}

/// Broken invariants of the cross-boundary completion protocol.
///
/// These never describe a failing test; they mean the scheduler or a
/// runtime misbehaved and the run cannot be trusted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    /// A subscription already exists (or existed) for this id
    #[error("Listener already registered for: {id}")]
    DuplicateSubscription {
        /// Test id
        id: TestId,
    },

    /// Inbound message carried no id
    #[error("Message received without an id: {payload}")]
    MissingId {
        /// Raw message text
        payload: String,
    },

    /// Inbound message id has no subscriber
    #[error("No listener registered for {id}")]
    UnknownSubscriber {
        /// Test id
        id: TestId,
    },

    /// Inbound message was not the `{result, id, message}` shape
    #[error("Malformed message ({reason}): {payload}")]
    Malformed {
        /// Parser diagnostic
        reason: String,
        /// Raw message text
        payload: String,
    },
}
