//! Pipelined database command engine.
//!
//! A worker holds one [`Pipeline`] over one non-blocking connection.
//! Handlers submit queries with [`Pipeline::submit_async`]; the contexts a
//! handler submits for one client action form a [`Chain`], sealed into the
//! queue by [`Pipeline::chain_done`]. [`Pipeline::drain`] matches results
//! to contexts strictly in send order and runs a chain's continuations once
//! every node has its result.
//!
//! Context owners are [`ClientId`](chatd_core::ClientId)s, resolved
//! through an [`OwnerSink`] when a response is due, so a client that
//! disconnected mid-flight is simply not found.

pub mod chain;
pub mod ctx;
pub mod driver;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod result;

#[cfg(any(test, feature = "scripted"))]
pub mod scripted;

pub use chain::Chain;
pub use ctx::{first_i64, keep_rows, Ctx, Decode, Exec, ExecResult, Payload, ResultKind};
pub use driver::{Param, PipelineDriver};
pub use error::{PipelineError, Result};
pub use pipeline::{OwnerSink, Pipeline, PipelineStats, INTERNAL_ERROR};
pub use queue::PipelineQueue;
pub use result::{DbResult, ResultStatus};

#[cfg(any(test, feature = "scripted"))]
pub use scripted::{ScriptHandle, ScriptedDriver};
