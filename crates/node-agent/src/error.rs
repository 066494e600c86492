//! Error types for the node agent

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Transient transport failure; the reconnect loop retries with backoff
    #[error("Connection error: {0}")]
    Connection(String),

    /// The gateway rejected our token. Fatal for the current token; a new
    /// one must be obtained out-of-band.
    #[error("Authentication rejected: {0}")]
    Auth(String),

    /// Pulling the authoritative configuration failed
    #[error("Config pull failed: {0}")]
    ConfigPull(String),

    /// A task driver failed
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// Task already has a running driver
    #[error("Task already running: {0}")]
    TaskAlreadyRunning(String),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
