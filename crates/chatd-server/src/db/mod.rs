//! Entity submitters.
//!
//! Each function sends one statement through the worker's pipeline and
//! installs the decoder that turns its rows into a [`Payload`]. Callers
//! build the [`Ctx`] (owner, continuation) and decide where the chain ends.
//!
//! [`Payload`]: chatd_pipeline::Payload
//! [`Ctx`]: chatd_pipeline::Ctx

pub mod group;
pub mod message;
pub mod model;
pub mod user;
pub mod userfile;
