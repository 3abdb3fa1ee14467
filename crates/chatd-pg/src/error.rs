//! Driver error types.

use chatd_pipeline::PipelineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PgError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed connection string.
    #[error("conninfo: {0}")]
    Config(String),
    /// The server sent something the protocol does not allow here.
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    /// SASL, GSS, SSPI, ...
    #[error("unsupported authentication method (code {0})")]
    UnsupportedAuth(i32),
    /// ErrorResponse outside of a query.
    #[error("{severity} {code}: {message}")]
    Server {
        severity: String,
        code: String,
        message: String,
    },
    #[error("connection closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, PgError>;

impl From<PgError> for PipelineError {
    fn from(e: PgError) -> Self {
        match e {
            PgError::Io(io) => PipelineError::Io(io),
            PgError::Closed => PipelineError::Disconnected,
            other => PipelineError::Driver(other.to_string()),
        }
    }
}
