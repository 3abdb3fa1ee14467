//! Submission, sealing and result drain for one worker's connection.
//!
//! ```text
//!   handler ──submit_async──► driver (send + sync|flush)
//!      │                         │
//!      └─► current chain         │ results, in send order
//!            │ chain_done        ▼
//!            └──► queue [ chain | chain | ... ] ◄── drain: oldest pending ctx
//!                                   │
//!                         resolved ─┴─► pop, run continuations
//! ```

use std::os::unix::io::RawFd;

use chatd_core::ClientId;
use tracing::{debug, error, info, trace, warn};

use crate::chain::Chain;
use crate::ctx::Ctx;
use crate::driver::{Param, PipelineDriver};
use crate::error::{PipelineError, Result};
use crate::queue::PipelineQueue;
use crate::result::ResultStatus;

/// Text sent to owners whose work was abandoned with the connection.
pub const INTERNAL_ERROR: &str = "Internal error, try again";

/// Reaches a client by id at delivery time.
///
/// Implementations look the owner up on every call; an owner that has
/// disconnected is simply not found and the call does nothing.
pub trait OwnerSink {
    fn send_error(&mut self, owner: ClientId, from: &str, msg: &str);
}

/// Counters for one pipeline.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    /// Queries handed to the driver.
    pub submitted: u64,
    /// Results matched to a context.
    pub results: u64,
    /// Chains finalized normally.
    pub completed: u64,
    /// Chains dropped by a connection failure.
    pub abandoned: u64,
    /// Successful reconnects.
    pub reconnects: u64,
}

/// One worker's pipelined connection with its queue and chain in progress.
pub struct Pipeline<E> {
    driver: Box<dyn PipelineDriver>,
    queue: PipelineQueue<Chain<E>>,
    current: Chain<E>,
    needs_reconnect: bool,
    stats: PipelineStats,
}

impl<E: OwnerSink> Pipeline<E> {
    pub fn new(driver: Box<dyn PipelineDriver>, capacity: usize) -> Self {
        Self {
            driver,
            queue: PipelineQueue::new(capacity),
            current: Chain::new(),
            needs_reconnect: false,
            stats: PipelineStats::default(),
        }
    }

    /// Send `sql` and append `ctx` to the chain in progress.
    ///
    /// The first query after the queue went idle carries a sync so its
    /// result becomes retrievable; later ones only flush. On error the
    /// context is dropped and nothing was queued for it.
    pub fn submit_async(&mut self, sql: &str, params: &[Param], ctx: Ctx<E>) -> Result<()> {
        if self.needs_reconnect {
            return Err(PipelineError::Disconnected);
        }
        if self.queue.is_full() {
            return Err(PipelineError::QueueFull {
                capacity: self.queue.capacity(),
            });
        }

        let idle = self.queue.is_empty();
        let sent = self.driver.send_query(sql, params).and_then(|()| {
            if idle {
                self.driver.pipeline_sync()
            } else {
                self.driver.send_flush()
            }
        });
        if let Err(e) = sent {
            warn!(error = %e, label = ctx.label(), "query submission failed");
            self.needs_reconnect = true;
            return Err(e);
        }

        trace!(label = ctx.label(), idle, "query sent");
        self.stats.submitted += 1;
        self.current.push(ctx);
        Ok(())
    }

    /// Seal the chain in progress into one queue entry.
    pub fn chain_done(&mut self, env: &mut E) {
        if self.current.is_empty() {
            return;
        }
        let chain = std::mem::take(&mut self.current);
        if let Err(chain) = self.queue.push(chain) {
            error!(
                capacity = self.queue.capacity(),
                "pipeline queue overflow, correlation lost"
            );
            self.abandon(env, Some(chain), "pipeline queue overflow");
        }
    }

    /// Match every available result to its context, finalizing chains as
    /// they complete. Returns the number of results matched.
    pub fn drain(&mut self, env: &mut E) -> usize {
        if self.needs_reconnect {
            return 0;
        }
        self.chain_done(env);

        if let Err(e) = self.driver.consume_input() {
            self.fail_connection(env, &e.to_string());
            return 0;
        }

        let mut matched = 0;
        while let Some(res) = self.driver.next_result() {
            match res.status() {
                ResultStatus::PipelineSync => {
                    trace!("pipeline sync");
                    continue;
                }
                status if status.is_connection_fatal() => {
                    let reason = res.error_message().unwrap_or("connection lost").to_string();
                    self.fail_connection(env, &reason);
                    break;
                }
                _ => {}
            }

            let Some(chain) = self.queue.peek_mut() else {
                error!(status = ?res.status(), "result with no pending command");
                self.fail_connection(env, "result with no pending command");
                break;
            };
            let Some(ctx) = chain.first_pending_mut() else {
                error!("queue head has no pending command");
                self.fail_connection(env, "queue head already resolved");
                break;
            };
            ctx.resolve(&res);
            matched += 1;
            self.stats.results += 1;

            if chain.is_resolved() {
                if let Some(chain) = self.queue.pop() {
                    self.finalize(env, chain);
                }
                if self.needs_reconnect {
                    break;
                }
            }
        }
        matched
    }

    /// Run each node's continuation in chain order, then seal whatever
    /// they submitted as a chain of its own.
    fn finalize(&mut self, env: &mut E, chain: Chain<E>) {
        let mut nodes = chain.into_nodes();
        for i in 0..nodes.len() {
            let Some(exec) = nodes[i].take_exec() else {
                continue;
            };
            let owner = nodes[i].owner();
            let label = nodes[i].label();
            if let Err(msg) = exec(env, self, &mut nodes[i..]) {
                debug!(label, error = %msg, "continuation failed");
                if let Some(owner) = owner {
                    env.send_error(owner, label, &msg);
                }
            }
        }
        self.stats.completed += 1;
        self.chain_done(env);
    }

    /// Abandon all in-flight work and mark the connection for reopening.
    ///
    /// Continuations do not run; each reachable owner gets one
    /// [`INTERNAL_ERROR`].
    pub fn fail_connection(&mut self, env: &mut E, reason: &str) {
        self.abandon(env, None, reason);
    }

    fn abandon(&mut self, env: &mut E, extra: Option<Chain<E>>, reason: &str) {
        let mut chains: Vec<Chain<E>> = Vec::with_capacity(self.queue.len() + 2);
        while let Some(chain) = self.queue.pop() {
            chains.push(chain);
        }
        chains.extend(extra);
        if !self.current.is_empty() {
            chains.push(std::mem::take(&mut self.current));
        }

        warn!(reason, chains = chains.len(), "database connection failed");

        let mut notified: Vec<ClientId> = Vec::new();
        for chain in &chains {
            for (owner, label) in chain.owners() {
                if !notified.contains(&owner) {
                    notified.push(owner);
                    env.send_error(owner, label, INTERNAL_ERROR);
                }
            }
        }
        self.stats.abandoned += chains.len() as u64;
        self.needs_reconnect = true;
    }

    /// Drop any in-flight work and reopen the connection.
    pub fn reconnect(&mut self, env: &mut E) -> Result<()> {
        if self.has_pending() {
            self.abandon(env, None, "reconnect requested");
        }
        self.driver.reconnect()?;
        self.needs_reconnect = false;
        self.stats.reconnects += 1;
        info!(fd = self.driver.socket(), "database connection reopened");
        Ok(())
    }

    /// Push buffered output to the socket.
    pub fn flush_output(&mut self) -> Result<bool> {
        match self.driver.flush_output() {
            Ok(done) => Ok(done),
            Err(e) => {
                self.needs_reconnect = true;
                Err(e)
            }
        }
    }

    pub fn wants_write(&self) -> bool {
        self.driver.wants_write()
    }

    /// Something is sent or about to be sealed and has no result yet.
    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty() || !self.current.is_empty()
    }

    /// Sealed chains awaiting results.
    pub fn in_flight(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn needs_reconnect(&self) -> bool {
        self.needs_reconnect
    }

    pub fn socket(&self) -> RawFd {
        self.driver.socket()
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }
}
