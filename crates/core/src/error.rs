//! Error types for the control plane

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Transient transport failure. The node agent retries with backoff.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The presented token was rejected. A new token must be obtained
    /// out-of-band; there is no automatic retry.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// A single validation category failed. Other categories and running
    /// tasks are unaffected.
    #[error("Validation failed for {category}: {message}")]
    Validation { category: String, message: String },

    /// No live session exists for the target node.
    #[error("Node offline: {0}")]
    NodeOffline(String),

    /// A config push was attempted while the node was unreachable.
    #[error("Config delivery failed: node {0} is unreachable")]
    ConfigDelivery(String),

    /// Malformed or unrecognized frame. The offending session is dropped.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether the caller may retry the same request unchanged.
    ///
    /// `Auth` and `ConfigDelivery` are deliberately excluded: the first needs
    /// a new token, the second an explicit re-trigger by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::NodeOffline(_))
    }
}
