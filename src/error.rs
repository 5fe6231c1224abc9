//! Error types for anvilq operations.

use crate::task::TaskId;
use thiserror::Error;

/// Result type used throughout anvilq.
pub type AnvilResult<T> = Result<T, AnvilError>;

/// Main error type for anvilq operations.
#[derive(Error, Debug)]
pub enum AnvilError {
    /// No task with the given id exists in the store
    #[error("Task {id} not found")]
    TaskNotFound {
        /// The missing task id
        id: TaskId,
    },

    /// A task with the same id is already stored (or appears twice in one batch)
    #[error("Task {id} already exists")]
    DuplicateTask {
        /// The conflicting task id
        id: TaskId,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Store backend error
    #[error("Store error: {message}")]
    Store {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The isolation lock could not be taken in time
    #[error("Timed out after {timeout_ms}ms waiting for the isolation lock")]
    LockTimeout {
        /// How long we waited
        timeout_ms: u64,
    },

    /// Connection refused, timed out or lost
    #[error("Transport error: {message}")]
    Transport {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Raw IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame on the wire could not be understood
    #[error("Protocol error: {message}")]
    Protocol {
        /// Error message
        message: String,
    },

    /// A task handler failed
    #[error("Handler failed: {message}")]
    Handler {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Error message
        message: String,
    },

    /// The component is already running
    #[error("Already running")]
    AlreadyRunning,

    /// The component is not running
    #[error("Not running")]
    NotRunning,

    /// The component has been closed
    #[error("Closed")]
    Closed,

    /// Database error
    #[cfg(feature = "postgres-store")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres-store")))]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl AnvilError {
    /// Create a new store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new transport error wrapping its cause
    pub fn transport<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a handler error
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Whether the error came from the network rather than from the queue itself
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(AnvilError::transport("connect failed", io).is_transport());
        assert!(AnvilError::Io(std::io::Error::other("boom")).is_transport());
        assert!(!AnvilError::protocol("bad frame").is_transport());
        assert!(!AnvilError::LockTimeout { timeout_ms: 10 }.is_transport());
    }

    #[test]
    fn test_messages() {
        let id = uuid::Uuid::nil();
        let err = AnvilError::TaskNotFound { id };
        assert_eq!(
            err.to_string(),
            "Task 00000000-0000-0000-0000-000000000000 not found"
        );
        assert_eq!(
            AnvilError::config("bad port").to_string(),
            "Configuration error: bad port"
        );
    }
}
