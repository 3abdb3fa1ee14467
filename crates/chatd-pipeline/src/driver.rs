//! The database driver seam.
//!
//! A driver owns one non-blocking connection that is already in pipeline
//! mode. The pipeline only ever talks to it through [`PipelineDriver`], so
//! the PostgreSQL frontend and the scripted test driver are interchangeable.

use std::os::unix::io::RawFd;

use crate::error::Result;
use crate::result::DbResult;

/// One positional query parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    Null,
    /// Sent in text format.
    Text(String),
    /// Sent in binary format.
    Bytes(Vec<u8>),
}

impl Param {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<&str> for Param {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Param {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&String> for Param {
    fn from(v: &String) -> Self {
        Self::Text(v.clone())
    }
}

impl From<Vec<u8>> for Param {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<bool> for Param {
    fn from(v: bool) -> Self {
        Self::Text(if v { "t" } else { "f" }.to_string())
    }
}

macro_rules! param_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Param {
                fn from(v: $t) -> Self {
                    Self::Text(v.to_string())
                }
            }
        )*
    };
}

param_from_int!(i32, i64, u32, u64, usize);

impl<T: Into<Param>> From<Option<T>> for Param {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Build a `Vec<Param>` from heterogeneous values.
///
/// ```ignore
/// let p = params![user_id, "hello", None::<String>];
/// ```
#[macro_export]
macro_rules! params {
    () => { ::std::vec::Vec::<$crate::Param>::new() };
    ($($v:expr),+ $(,)?) => { vec![$($crate::Param::from($v)),+] };
}

/// Non-blocking pipelined connection.
///
/// Results must come back from [`next_result`](Self::next_result) in the
/// order their queries were passed to [`send_query`](Self::send_query),
/// with one [`ResultStatus::PipelineSync`](crate::ResultStatus::PipelineSync)
/// per [`pipeline_sync`](Self::pipeline_sync).
pub trait PipelineDriver: Send {
    /// Queue one parameterized statement. Never waits for its result.
    fn send_query(&mut self, sql: &str, params: &[Param]) -> Result<()>;

    /// Mark a sync boundary; the server answers with a sync result.
    fn pipeline_sync(&mut self) -> Result<()>;

    /// Ask the server to send whatever results it has so far.
    fn send_flush(&mut self) -> Result<()>;

    /// Read everything currently available on the socket without blocking.
    fn consume_input(&mut self) -> Result<()>;

    /// Next complete result, or `None` when nothing more is buffered.
    fn next_result(&mut self) -> Option<DbResult>;

    /// Descriptor to poll for readiness.
    fn socket(&self) -> RawFd;

    /// Drop the current connection and establish a fresh one.
    fn reconnect(&mut self) -> Result<()>;

    /// Buffered output is waiting for the socket to become writable.
    fn wants_write(&self) -> bool {
        false
    }

    /// Push buffered output. `Ok(true)` once everything is written.
    fn flush_output(&mut self) -> Result<bool> {
        Ok(true)
    }
}
