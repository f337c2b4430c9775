//! Network error types.

use std::time::Duration;

/// Errors that can occur in the datamesh_network crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// A transport-level error (WebSocket connect/send/receive).
    #[error("Transport error: {0}")]
    Transport(String),

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// A peer address could not be parsed into host:port form.
    #[error("Invalid peer address: {0}")]
    InvalidAddress(String),

    /// A DHT put could not replicate to any of the candidate nodes.
    #[error("Replication failed: {0}")]
    Replication(String),

    /// No configured bootstrap seed responded to a join attempt.
    #[error("Bootstrap failed: no seed responded")]
    NoSeedReachable,

    /// The node is not running.
    #[error("Node not running")]
    NotRunning,

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
