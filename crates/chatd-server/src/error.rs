//! Server error type.

use std::io;
use std::os::unix::io::RawFd;

use chatd_pg::PgError;
use chatd_pipeline::PipelineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("config file {path}: {source}")]
    ConfigFile {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("fd {0} is already registered")]
    AlreadyRegistered(RawFd),

    #[error("database: {0}")]
    Database(#[from] PgError),

    #[error("pipeline: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("thread spawn failed: {0}")]
    Spawn(String),
}

pub type Result<T> = std::result::Result<T, ServerError>;
