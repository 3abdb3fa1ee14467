//! The process-wide registry object and its lifecycle.
//!
//! ```text
//!                   ┌────────────── Arc<Server> ───────────────┐
//!                   │ events  clients  sessions  uploads files │
//!                   └──────────────────────────────────────────┘
//!   chatd-dispatcher: epoll wait ─► inline sources (listener, timers, signals)
//!                          │
//!                          └─► JobQueue<Job> ─► chatd-worker-N (client sockets + DB pipeline)
//! ```

use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chatd_core::JobQueue;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::client::{Client, ClientRegistry};
use crate::config::ServerConfig;
use crate::dispatcher;
use crate::error::{Result, ServerError};
use crate::event::{EventRegistry, Mode, Registration};
use crate::files::FileStore;
use crate::session::SessionStore;
use crate::sys::{EventFd, Listener, SignalFd, TimerFd};
use crate::upload::UploadStore;
use crate::worker::{self, DriverFactory};

const LISTEN_BACKLOG: i32 = 128;
const REGISTRY_SIZE: usize = 256;

/// What a timer expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Session(u32),
    UploadToken(u32),
}

pub struct Timer {
    pub fd: TimerFd,
    pub kind: TimerKind,
}

/// Everything the dispatcher can wait on.
pub enum Source {
    Listener(Listener),
    Client(Arc<Client>),
    Timer(Timer),
    Signal(SignalFd),
    Wake(Arc<EventFd>),
}

impl Source {
    pub fn name(&self) -> &'static str {
        match self {
            Source::Listener(_) => "listener",
            Source::Client(_) => "client",
            Source::Timer(_) => "timer",
            Source::Signal(_) => "signal",
            Source::Wake(_) => "wake",
        }
    }
}

/// A readiness event handed to a worker. Holding the registration keeps
/// the descriptor open until the job is done.
pub struct Job {
    pub reg: Arc<Registration<Source>>,
    pub events: u32,
}

pub struct Server {
    config: ServerConfig,
    events: EventRegistry<Source>,
    clients: ClientRegistry,
    sessions: SessionStore,
    uploads: UploadStore,
    files: FileStore,
    jobs: JobQueue<Job>,
    running: AtomicBool,
    wake: Arc<EventFd>,
    /// Timers cancelled off the dispatcher, waiting for it to close them.
    cancelled: Mutex<Vec<(RawFd, TimerKind)>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    /// Validate `config`, create upload directories and the epoll set.
    /// Nothing listens until [`bind`](Self::bind).
    pub fn new(config: ServerConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let files = FileStore::from_config(&config);
        files.create_dirs()?;

        let server = Arc::new(Self {
            events: EventRegistry::new(REGISTRY_SIZE)?,
            clients: ClientRegistry::new(),
            sessions: SessionStore::new(),
            uploads: UploadStore::new(),
            files,
            jobs: JobQueue::new(config.job_queue_capacity),
            running: AtomicBool::new(true),
            wake: Arc::new(EventFd::new()?),
            cancelled: Mutex::new(Vec::new()),
            local_addr: Mutex::new(None),
            config,
        });
        let wake = Arc::clone(&server.wake);
        server
            .events
            .register(wake.as_raw_fd(), Mode::Inline, Source::Wake(wake))?;
        Ok(server)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn events(&self) -> &EventRegistry<Source> {
        &self.events
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn uploads(&self) -> &UploadStore {
        &self.uploads
    }

    pub fn files(&self) -> &FileStore {
        &self.files
    }

    pub fn jobs(&self) -> &JobQueue<Job> {
        &self.jobs
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Address the listener is bound to, once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Open the listening socket and hand it to the dispatcher.
    pub fn bind(&self) -> Result<SocketAddr> {
        let listener = Listener::bind(self.config.listen_addr()?, LISTEN_BACKLOG)?;
        let addr = listener.local_addr();
        self.events
            .register(listener.as_raw_fd(), Mode::Inline, Source::Listener(listener))?;
        *self.local_addr.lock() = Some(addr);
        info!(%addr, "listening");
        Ok(addr)
    }

    /// Stop on SIGINT/SIGTERM.
    pub fn watch_signals(&self, signals: SignalFd) -> Result<()> {
        self.events
            .register(signals.as_raw_fd(), Mode::Inline, Source::Signal(signals))?;
        Ok(())
    }

    /// Ask the dispatcher to stop. Safe from any thread.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!("shutdown requested");
        }
        if let Err(e) = self.wake.notify() {
            warn!(error = %e, "wake notify failed");
        }
    }

    /// Run workers and the dispatcher until shutdown, then tear everything
    /// down. Each worker calls `factory` on its own thread.
    pub fn run(self: &Arc<Self>, factory: DriverFactory) -> Result<()> {
        let mut workers = Vec::with_capacity(self.config.workers);
        for id in 0..self.config.workers {
            match worker::spawn(Arc::clone(self), id, Arc::clone(&factory)) {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    error!(worker = id, error = %e, "worker spawn failed");
                    self.shutdown();
                    break;
                }
            }
        }

        let dispatcher = {
            let server = Arc::clone(self);
            thread::Builder::new()
                .name("chatd-dispatcher".into())
                .spawn(move || dispatcher::run(&server))
                .map_err(|e| ServerError::Spawn(e.to_string()))?
        };
        let outcome = match dispatcher.join() {
            Ok(res) => res,
            Err(_) => Err(ServerError::Spawn("dispatcher panicked".into())),
        };
        if let Err(e) = &outcome {
            error!(error = %e, "dispatcher stopped");
        }

        self.running.store(false, Ordering::Release);
        self.jobs.shutdown();
        for handle in workers {
            if handle.join().is_err() {
                error!("worker panicked");
            }
        }
        self.close_all();
        info!("server stopped");
        outcome
    }

    /// Tear down every remaining registration. Only cleanup that needs no
    /// database connection happens here.
    pub fn close_all(&self) {
        let regs = self.events.snapshot();
        debug!(count = regs.len(), "closing remaining descriptors");
        for reg in regs {
            self.events.unregister(&reg, |src| {
                if let Source::Client(client) = src {
                    self.clients.remove(client.id());
                }
            });
        }
    }

    /// Tear down an inline source.
    pub fn close_inline(&self, reg: &Arc<Registration<Source>>) {
        let name = reg.data().name();
        self.events.unregister(reg, |src| match src {
            Source::Timer(t) => debug!(fd = t.fd.as_raw_fd(), kind = ?t.kind, "timer closed"),
            _ => debug!(fd = reg.fd(), source = name, "closed"),
        });
    }

    /// Arm a one-shot timer and register it. Returns its fd, which is the
    /// handle for [`cancel_timer`](Self::cancel_timer).
    pub fn start_timer(&self, kind: TimerKind, after: Duration) -> Result<RawFd> {
        let fd = TimerFd::new()?;
        fd.arm_once(after)?;
        let raw = fd.as_raw_fd();
        self.events
            .register(raw, Mode::Inline, Source::Timer(Timer { fd, kind }))?;
        debug!(fd = raw, ?kind, ?after, "timer armed");
        Ok(raw)
    }

    /// Disarm the timer at `fd` if it still is the one for `kind`. Safe
    /// from any thread; the dispatcher closes the registration once woken.
    pub fn cancel_timer(&self, fd: RawFd, kind: TimerKind) -> bool {
        let Some(reg) = self.events.lookup(fd) else {
            return false;
        };
        let Source::Timer(t) = reg.data() else {
            return false;
        };
        if t.kind != kind {
            return false;
        }
        if let Err(e) = t.fd.disarm() {
            warn!(fd, ?kind, error = %e, "timer disarm failed");
        }
        self.cancelled.lock().push((fd, kind));
        if let Err(e) = self.wake.notify() {
            warn!(error = %e, "wake notify failed");
        }
        true
    }

    /// Close timers cancelled since the last call. Dispatcher only.
    pub(crate) fn close_cancelled_timers(&self) -> usize {
        let cancelled = std::mem::take(&mut *self.cancelled.lock());
        let mut closed = 0;
        for (fd, kind) in cancelled {
            let Some(reg) = self.events.lookup(fd) else {
                continue;
            };
            if matches!(reg.data(), Source::Timer(t) if t.kind == kind) {
                self.close_inline(&reg);
                closed += 1;
            }
        }
        closed
    }

    /// Start the expiry clock for a session whose client went away.
    pub fn start_session_timer(&self, session_id: u32) {
        let kind = TimerKind::Session(session_id);
        match self.start_timer(kind, self.config.session_timeout()) {
            Ok(fd) => {
                if let Some(old) = self.sessions.set_timer(session_id, Some(fd)) {
                    self.cancel_timer(old, kind);
                }
            }
            Err(e) => warn!(session = session_id, error = %e, "session timer not started"),
        }
    }

    /// Stop a session's expiry clock on resume.
    pub fn stop_session_timer(&self, session_id: u32) {
        if let Some(fd) = self.sessions.set_timer(session_id, None) {
            self.cancel_timer(fd, TimerKind::Session(session_id));
        }
    }

    /// Bound an upload token's life.
    pub fn start_upload_timer(&self, token: u32) {
        let kind = TimerKind::UploadToken(token);
        match self.start_timer(kind, self.config.upload_token_timeout()) {
            Ok(fd) => {
                self.uploads.set_timer(token, Some(fd));
            }
            Err(e) => warn!(token, error = %e, "upload timer not started"),
        }
    }

    pub fn stop_upload_timer(&self, token: u32, timer: Option<RawFd>) {
        if let Some(fd) = timer {
            self.cancel_timer(fd, TimerKind::UploadToken(token));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::tests::Harness;

    #[test]
    fn test_cancel_off_dispatcher_defers_close() {
        let h = Harness::new();
        let server = Arc::clone(&h.server);
        let kind = TimerKind::Session(7);
        let fd = server.start_timer(kind, Duration::from_secs(60)).unwrap();

        let remote = Arc::clone(&server);
        let cancelled = thread::spawn(move || remote.cancel_timer(fd, kind))
            .join()
            .unwrap();
        assert!(cancelled);
        let reg = server.events().lookup(fd).unwrap();
        assert!(!reg.is_closed());
        assert!(!server.cancel_timer(fd, TimerKind::UploadToken(7)));

        assert_eq!(server.close_cancelled_timers(), 1);
        assert!(reg.is_closed());
        assert!(server.events().lookup(fd).is_none());
        assert_eq!(server.close_cancelled_timers(), 0);
    }
}
