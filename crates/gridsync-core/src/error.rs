//! Error types for Gridsync

use thiserror::Error;

/// Main error type for grid node operations
#[derive(Error, Debug)]
pub enum GridError {
    /// Rendezvous join/listen failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Payload write/unpack failure on a replica
    #[error("Replication error: {0}")]
    Replication(String),

    /// A send to a specific peer failed
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// Error reported by the task-execution collaborator
    #[error("Task error: {0}")]
    Task(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid or incomplete configuration
    #[error("Config error: {0}")]
    Config(String),

    /// An operation did not complete in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The peer connection closed before the operation finished
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<postcard::Error> for GridError {
    fn from(err: postcard::Error) -> Self {
        GridError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for GridError {
    fn from(err: serde_json::Error) -> Self {
        GridError::Serialization(err.to_string())
    }
}

/// Result type alias using GridError
pub type GridResult<T> = Result<T, GridError>;
