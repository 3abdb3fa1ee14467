//! # chatd-server
//!
//! The chat server runtime: one dispatcher thread waiting on epoll, a
//! fixed pool of workers each holding one pipelined database connection.
//!
//! ## Modules
//!
//! - `server` - Registry object, lifecycle, timers
//! - `dispatcher` - Readiness loop and inline sources
//! - `worker` - Worker threads, job handling, `WorkerEnv`
//! - `event` - fd → registration map mirrored into epoll
//! - `sys` - epoll, eventfd, timerfd, signalfd, sockets
//! - `client` - Connections and the client registry
//! - `frame` - Length-prefixed JSON framing
//! - `command` - The client command set
//! - `handler` - Command handlers and their continuations
//! - `db` - Statement submitters per entity
//! - `files` - Content-addressed upload storage
//! - `session` - Resumable login sessions
//! - `upload` - Upload tokens
//! - `status` - Real-time user status broadcasts
//! - `config` - Layered configuration

pub mod client;
pub mod command;
pub mod config;
pub mod db;
mod dispatcher;
pub mod error;
pub mod event;
pub mod files;
pub mod frame;
pub mod handler;
pub mod server;
pub mod session;
pub mod status;
pub mod sys;
pub mod upload;
pub mod worker;

// Re-exports for convenience
pub use config::{CliArgs, ServerConfig, USAGE};
pub use error::{Result, ServerError};
pub use server::Server;
pub use worker::{DbCtx, DbPipeline, DriverFactory, WorkerEnv};
