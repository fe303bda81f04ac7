//! Error types for serialized execution and the transports beneath it

use std::time::Duration;

use thiserror::Error;

/// Errors raised by a [`Transport`](crate::Transport) implementation
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Exchange not found: {name}")]
    UnknownExchange { name: String },

    #[error("Queue not found: {name}")]
    UnknownQueue { name: String },

    #[error("Consumer not found: {tag}")]
    UnknownConsumer { tag: String },

    #[error("Broker refused request: {0}")]
    Broker(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Broker did not answer within {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TransportError {
    /// True when the connection is already gone, which callers closing a
    /// connection are allowed to ignore
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, TransportError::ConnectionClosed)
    }
}

/// Errors surfaced to threads that submit work to the owning thread
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Task was not run within {0:?}")]
    Timeout(Duration),

    #[error("{0} cannot be called from inside an inbound message callback")]
    Reentrancy(&'static str),

    #[error("Task failed: {0}")]
    TaskFailure(String),

    #[error("Event loop has stopped")]
    Stopped,

    #[error("Task outcome was already retrieved")]
    AlreadyRetrieved,

    #[error("Failed to spawn owning thread: {0}")]
    Spawn(std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl ExecError {
    /// Wrap any displayable failure raised by a task body
    pub fn task_failure(err: impl std::fmt::Display) -> Self {
        ExecError::TaskFailure(err.to_string())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecError::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message() {
        let err = ExecError::Timeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "Task was not run within 250ms");
        assert!(err.is_timeout());
    }

    #[test]
    fn test_reentrancy_message_names_the_call() {
        let err = ExecError::Reentrancy("process_events");
        assert_eq!(
            err.to_string(),
            "process_events cannot be called from inside an inbound message callback"
        );
    }

    #[test]
    fn test_transport_error_converts() {
        let err: ExecError = TransportError::ConnectionClosed.into();
        assert!(matches!(err, ExecError::Transport(TransportError::ConnectionClosed)));
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_is_connection_closed() {
        assert!(TransportError::ConnectionClosed.is_connection_closed());
        assert!(!TransportError::Broker("nope".to_string()).is_connection_closed());
    }
}
