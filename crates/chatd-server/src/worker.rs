//! Worker threads: client jobs in, pipelined database work out.
//!
//! Each worker owns one database connection. It sleeps on the job queue
//! only when nothing is in flight on that connection; otherwise it keeps
//! an eye on the database socket so results never sit unread.
//!
//! ```text
//!   loop:
//!     reconnect if needed (100ms .. 5s backoff)
//!     db readable?  ──► drain
//!     in flight?    ──► try_dequeue, else poll db socket 1ms
//!     idle?         ──► dequeue (blocking)
//!     job           ──► handler ──► chain_done
//! ```

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chatd_core::{ClientId, Dequeued};
use chatd_pipeline::{Ctx, OwnerSink, Pipeline, PipelineDriver, PipelineError};
use serde_json::{json, Value};
use tracing::{debug, error, info, trace, warn};

use crate::client::Client;
use crate::error::{Result, ServerError};
use crate::event::Flow;
use crate::handler;
use crate::server::{Job, Server, Source};
use crate::status::{self, Status, StatusUpdate};
use crate::sys;

pub type DbPipeline = Pipeline<WorkerEnv>;
pub type DbCtx = Ctx<WorkerEnv>;

/// Opens one database connection. Called on the worker's own thread.
pub type DriverFactory =
    Arc<dyn Fn() -> std::result::Result<Box<dyn PipelineDriver>, PipelineError> + Send + Sync>;

const DB_POLL_MS: i32 = 1;
const BACKOFF_MIN: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(5);
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(1);

/// Error frame sent to a client.
pub fn error_frame(from: &str, msg: &str) -> Value {
    json!({ "cmd": "error", "from": from, "error_msg": msg })
}

/// What continuations see of their worker.
pub struct WorkerEnv {
    server: Arc<Server>,
    worker_id: usize,
}

impl WorkerEnv {
    pub fn new(server: Arc<Server>, worker_id: usize) -> Self {
        Self { server, worker_id }
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Deliver to `owner` if it is still connected.
    pub fn send(&self, owner: ClientId, value: &Value) -> bool {
        self.server.clients().send_to(owner, value)
    }
}

impl OwnerSink for WorkerEnv {
    fn send_error(&mut self, owner: ClientId, from: &str, msg: &str) {
        self.server.clients().send_to(owner, &error_frame(from, msg));
    }
}

struct Backoff {
    delay: Duration,
    next_attempt: Instant,
}

impl Backoff {
    fn new() -> Self {
        Self {
            delay: BACKOFF_MIN,
            next_attempt: Instant::now(),
        }
    }

    fn ready(&self) -> bool {
        Instant::now() >= self.next_attempt
    }

    fn remaining(&self) -> Duration {
        self.next_attempt.saturating_duration_since(Instant::now())
    }

    fn failed(&mut self) {
        self.next_attempt = Instant::now() + self.delay;
        self.delay = (self.delay * 2).min(BACKOFF_MAX);
    }

    fn reset(&mut self) {
        self.delay = BACKOFF_MIN;
    }
}

pub fn spawn(server: Arc<Server>, id: usize, factory: DriverFactory) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("chatd-worker-{id}"))
        .spawn(move || {
            let Some(driver) = connect(&server, id, &factory) else {
                return;
            };
            let mut env = WorkerEnv::new(Arc::clone(&server), id);
            let mut db = Pipeline::new(driver, server.config().pipeline_capacity);
            run(&mut env, &mut db);
        })
        .map_err(|e| ServerError::Spawn(e.to_string()))
}

/// First connection, retried with backoff until it works or the server
/// stops.
fn connect(server: &Server, id: usize, factory: &DriverFactory) -> Option<Box<dyn PipelineDriver>> {
    let mut backoff = Backoff::new();
    loop {
        match factory() {
            Ok(driver) => {
                info!(worker = id, fd = driver.socket(), "database connected");
                return Some(driver);
            }
            Err(e) => {
                warn!(worker = id, error = %e, "database connect failed");
                backoff.failed();
            }
        }
        match server.jobs().dequeue_timeout(backoff.remaining()) {
            Dequeued::Shutdown => return None,
            // Nobody can serve the job without a connection; let the
            // client retry.
            Dequeued::Job(job) => drop_job(server, job),
            Dequeued::Empty => {}
        }
    }
}

fn drop_job(server: &Server, job: Job) {
    let rearmed: Result<()> = match job.reg.data() {
        Source::Client(client) => {
            // Consume the requests so the event does not fire again at once.
            let frames = client.read_frames().map(|out| out.frames.len()).unwrap_or(1);
            for _ in 0..frames.max(1) {
                if client.send_json(&error_frame("", chatd_pipeline::INTERNAL_ERROR)).is_err() {
                    break;
                }
            }
            client.end_job().map_err(Into::into)
        }
        _ => server.events().rearm(&job.reg),
    };
    if let Err(e) = rearmed {
        debug!(fd = job.reg.fd(), error = %e, "rearm failed");
    }
}

/// The worker loop. Returns on job-queue shutdown.
pub fn run(env: &mut WorkerEnv, db: &mut DbPipeline) {
    let server = Arc::clone(env.server());
    let mut backoff = Backoff::new();
    debug!(worker = env.worker_id(), "worker running");

    loop {
        if db.needs_reconnect() && backoff.ready() {
            match db.reconnect(env) {
                Ok(()) => backoff.reset(),
                Err(e) => {
                    warn!(worker = env.worker_id(), error = %e, "reconnect failed");
                    backoff.failed();
                }
            }
        }

        if db.in_flight() > 0 {
            pump(env, db, 0);
        }

        let next = if db.in_flight() > 0 {
            match server.jobs().try_dequeue() {
                Dequeued::Empty => {
                    pump(env, db, DB_POLL_MS);
                    continue;
                }
                other => other,
            }
        } else if db.needs_reconnect() {
            server.jobs().dequeue_timeout(backoff.remaining().max(BACKOFF_MIN))
        } else {
            server.jobs().dequeue()
        };

        match next {
            Dequeued::Job(job) => {
                handle_job(env, db, job);
                db.chain_done(env);
            }
            Dequeued::Empty => {}
            Dequeued::Shutdown => break,
        }
    }

    finish(env, db);
    debug!(worker = env.worker_id(), "worker stopped");
}

/// Flush pending output, wait up to `timeout_ms` for the socket, drain.
fn pump(env: &mut WorkerEnv, db: &mut DbPipeline, timeout_ms: i32) {
    if db.needs_reconnect() {
        return;
    }
    let mut interest = libc::POLLIN;
    if db.wants_write() {
        if let Err(e) = db.flush_output() {
            db.fail_connection(env, &e.to_string());
            return;
        }
        if db.wants_write() {
            interest |= libc::POLLOUT;
        }
    }
    match sys::poll_fd(db.socket(), interest, timeout_ms) {
        Ok(0) => {}
        Ok(_) => {
            let n = db.drain(env);
            trace!(worker = env.worker_id(), results = n, "drained");
        }
        Err(e) => {
            error!(error = %e, "poll on database socket failed");
            db.fail_connection(env, &e.to_string());
        }
    }
}

/// Give in-flight work a moment to land before the connection goes.
fn finish(env: &mut WorkerEnv, db: &mut DbPipeline) {
    let deadline = Instant::now() + SHUTDOWN_DRAIN;
    while db.has_pending() && !db.needs_reconnect() && Instant::now() < deadline {
        db.chain_done(env);
        pump(env, db, DB_POLL_MS);
    }
    if db.has_pending() {
        db.fail_connection(env, "worker stopping");
    }
}

fn handle_job(env: &mut WorkerEnv, db: &mut DbPipeline, job: Job) {
    let reg = job.reg;
    if reg.is_closed() {
        return;
    }
    let Source::Client(client) = reg.data() else {
        warn!(fd = reg.fd(), source = reg.data().name(), "non-client job");
        return;
    };

    let mut flow = if job.events & (sys::EV_ERR | sys::EV_HUP) != 0 {
        Flow::Close
    } else {
        Flow::Keep
    };
    if flow == Flow::Keep && job.events & sys::EV_OUT != 0 {
        if let Err(e) = client.flush() {
            debug!(client = %client.id(), error = %e, "flush failed");
            flow = Flow::Close;
        }
    }
    if flow == Flow::Keep && job.events & (sys::EV_IN | sys::EV_RDHUP) != 0 {
        flow = handler::on_readable(env, db, client);
    }

    let flow = match flow {
        Flow::Keep => match client.end_job() {
            Ok(()) => Flow::Keep,
            Err(e) => {
                debug!(client = %client.id(), error = %e, "rearm failed");
                Flow::Close
            }
        },
        Flow::Close => Flow::Close,
    };
    if flow == Flow::Close {
        let server = Arc::clone(env.server());
        server
            .events()
            .unregister(&reg, |_| client_closed(env, db, client));
    }
}

/// Close callback for a client socket, run on a worker.
pub fn client_closed(env: &mut WorkerEnv, db: &mut DbPipeline, client: &Client) {
    let server = Arc::clone(env.server());
    server.clients().remove(client.id());
    info!(client = %client.id(), peer = client.peer(), "client disconnected");

    let Some(user) = client.user() else {
        return;
    };
    if let Err(e) = status::broadcast(db, StatusUpdate::status(user.user_id, Status::Offline)) {
        debug!(user = user.user_id.0, error = %e, "offline status not broadcast");
    }
    if let Some(session) = client.session_id() {
        server.start_session_timer(session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::recv_frames;
    use crate::event::Mode;
    use crate::frame;
    use crate::handler::tests::Harness;
    use std::io::{Read, Write};

    fn job_for(h: &Harness, client: &Arc<Client>, events: u32) -> Job {
        let reg = h.server.events().lookup(client.fd()).unwrap();
        assert!(client.begin_job());
        Job { reg, events }
    }

    #[test]
    fn test_output_event_flushes_without_reading() {
        let mut h = Harness::new();
        let (client, mut peer) = h.connect();
        client.attach(h.server.events().epoll());
        h.server
            .events()
            .register(client.fd(), Mode::Worker, Source::Client(Arc::clone(&client)))
            .unwrap();

        client
            .send_json(&json!({"cmd": "recv_msg", "content": "x".repeat(1 << 20)}))
            .unwrap();
        let before = client.pending_output();
        assert!(before > 0);
        peer.write_all(&frame::encode(br#"{"cmd":"nope"}"#)).unwrap();

        peer.set_nonblocking(true).unwrap();
        let mut sink = vec![0u8; 64 * 1024];
        while peer.read(&mut sink).is_ok() {}

        let job = job_for(&h, &client, sys::EV_OUT);
        handle_job(&mut h.env, &mut h.db, job);
        assert!(client.pending_output() < before);
        assert!(h.server.clients().get(client.id()).is_some());

        // The request is still unread; an input event answers it.
        while client.pending_output() > 0 {
            while peer.read(&mut sink).is_ok() {}
            client.flush().unwrap();
        }
        while peer.read(&mut sink).is_ok() {}
        let job = job_for(&h, &client, sys::EV_IN);
        handle_job(&mut h.env, &mut h.db, job);
        let got = recv_frames(&mut peer);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["from"], "nope");
    }

    #[test]
    fn test_hangup_closes_client() {
        let mut h = Harness::new();
        let (client, _peer) = h.connect();
        client.attach(h.server.events().epoll());
        let reg = h
            .server
            .events()
            .register(client.fd(), Mode::Worker, Source::Client(Arc::clone(&client)))
            .unwrap();

        let job = job_for(&h, &client, sys::EV_IN | sys::EV_HUP);
        handle_job(&mut h.env, &mut h.db, job);
        assert!(reg.is_closed());
        assert!(h.server.clients().get(client.id()).is_none());
    }
}
