//! Pipeline error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Every queue slot is taken by an in-flight chain.
    #[error("pipeline queue full ({capacity} chains in flight)")]
    QueueFull { capacity: usize },
    /// The connection failed and has not been reopened yet.
    #[error("database connection is down")]
    Disconnected,
    /// Driver-specific failure (handshake, protocol, auth).
    #[error("driver: {0}")]
    Driver(String),
    /// Socket-level failure.
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
