//! # chatd-core
//!
//! Thread-shared building blocks for the chat server.
//!
//! This crate has no knowledge of sockets, databases or JSON. The two
//! structures here are the only ones in the server that more than one
//! thread touches, so they are the only ones that lock internally.
//!
//! ## Modules
//!
//! - `ght` - Generic concurrent hash table keyed by `u64`
//! - `job_queue` - Bounded dispatcher → worker handoff queue
//! - `id` - Client / user id newtypes
//! - `env` - Environment variable utilities
//! - `log` - `tracing` subscriber bootstrap

pub mod env;
pub mod ght;
pub mod id;
pub mod job_queue;
pub mod log;

// Re-exports for convenience
pub use env::{env_get, env_get_bool, env_get_opt};
pub use ght::{hash_str, ConcurrentMap};
pub use id::{ClientId, ClientIdAllocator, UserId};
pub use job_queue::{Dequeued, JobQueue};
