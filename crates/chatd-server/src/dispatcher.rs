//! The readiness loop.
//!
//! Inline sources are handled right here; client sockets become jobs for
//! the worker pool. The loop never touches the database.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::client::Client;
use crate::error::Result;
use crate::event::{Flow, Mode, Registration};
use crate::server::{Job, Server, Source, TimerKind};
use crate::sys;

const EVENT_BATCH: usize = 64;

pub(crate) fn run(server: &Arc<Server>) -> Result<()> {
    let mut events = sys::empty_events(EVENT_BATCH);
    info!(registered = server.events().len(), "dispatcher running");
    while server.is_running() {
        let n = server.events().wait(&mut events, -1)?;
        for ev in &events[..n] {
            let (fd, flags) = (ev.u64 as i32, ev.events);
            dispatch(server, fd, flags);
        }
    }
    info!("dispatcher stopped");
    Ok(())
}

fn dispatch(server: &Server, fd: i32, flags: u32) {
    let Some(reg) = server.events().lookup(fd) else {
        trace!(fd, "event for an unregistered fd");
        return;
    };
    match reg.mode() {
        Mode::Worker => {
            if let Source::Client(client) = reg.data() {
                if !client.begin_job() {
                    trace!(client = %client.id(), "event while a job holds the client");
                    return;
                }
            }
            let job = Job { reg, events: flags };
            if let Err(job) = server.jobs().enqueue(job) {
                if server.jobs().is_shutdown() {
                    return;
                }
                warn!(fd, "job queue saturated, event deferred");
                let rearmed: Result<()> = match job.reg.data() {
                    Source::Client(client) => client.end_job().map_err(Into::into),
                    _ => server.events().rearm(&job.reg),
                };
                if let Err(e) = rearmed {
                    warn!(fd, error = %e, "rearm failed");
                }
            }
        }
        Mode::Inline => {
            let flow = if flags & (sys::EV_ERR | sys::EV_HUP) != 0 {
                Flow::Close
            } else {
                read_inline(server, &reg)
            };
            if flow == Flow::Close {
                server.close_inline(&reg);
            }
        }
    }
}

fn read_inline(server: &Server, reg: &Arc<Registration<Source>>) -> Flow {
    match reg.data() {
        Source::Listener(listener) => {
            accept_all(server, listener);
            Flow::Keep
        }
        Source::Timer(timer) => {
            if let Err(e) = timer.fd.read() {
                if e.kind() == std::io::ErrorKind::WouldBlock {
                    return Flow::Keep;
                }
                warn!(error = %e, "timer read failed");
            }
            expire(server, reg.fd(), timer.kind);
            Flow::Close
        }
        Source::Signal(signals) => {
            match signals.read_signal() {
                Ok(Some(signo)) => {
                    info!(signo, "termination signal");
                    server.shutdown();
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "signalfd read failed"),
            }
            Flow::Keep
        }
        Source::Wake(wake) => {
            let _ = wake.drain();
            let closed = server.close_cancelled_timers();
            if closed > 0 {
                trace!(closed, "cancelled timers closed");
            }
            Flow::Keep
        }
        Source::Client(client) => {
            warn!(client = %client.id(), "client socket in inline mode");
            Flow::Close
        }
    }
}

fn expire(server: &Server, fd: i32, kind: TimerKind) {
    match kind {
        TimerKind::Session(id) => {
            // A resumed session no longer points at this timer.
            let current = server.sessions().get(id).and_then(|s| s.timer);
            if current != Some(fd) {
                debug!(session = id, fd, "stale session timer");
                return;
            }
            if server.sessions().remove(id).is_some() {
                info!(session = id, "session expired");
            }
        }
        TimerKind::UploadToken(id) => {
            if server.uploads().remove(id).is_some() {
                info!(token = id, "upload token expired");
            }
        }
    }
}

fn accept_all(server: &Server, listener: &sys::Listener) {
    loop {
        let (fd, peer) = match listener.accept() {
            Ok(Some(conn)) => conn,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "accept failed");
                return;
            }
        };
        let id = server.clients().next_id();
        let client = Arc::new(Client::new(
            id,
            fd,
            peer.to_string(),
            server.config().max_frame_size,
        ));
        let raw = client.fd();
        client.attach(server.events().epoll());
        server.clients().insert(Arc::clone(&client));
        if let Err(e) = server
            .events()
            .register(raw, Mode::Worker, Source::Client(Arc::clone(&client)))
        {
            warn!(client = %id, error = %e, "client registration failed");
            server.clients().remove(id);
            continue;
        }
        debug!(client = %id, %peer, fd = raw, "client connected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::tests::Harness;
    use chatd_core::UserId;
    use std::thread;
    use std::time::Duration;

    fn fired_timer(server: &Server, kind: TimerKind) -> i32 {
        let fd = server.start_timer(kind, Duration::from_millis(1)).unwrap();
        thread::sleep(Duration::from_millis(20));
        fd
    }

    #[test]
    fn test_session_timer_expires_session() {
        let h = Harness::new();
        let sid = h.server.sessions().create(UserId(1));
        let fd = fired_timer(&h.server, TimerKind::Session(sid));
        h.server.sessions().set_timer(sid, Some(fd));

        dispatch(&h.server, fd, sys::EV_IN);
        assert!(h.server.sessions().get(sid).is_none());
        assert!(h.server.events().lookup(fd).is_none());
    }

    #[test]
    fn test_stopped_session_timer_does_not_expire() {
        let h = Harness::new();
        let sid = h.server.sessions().create(UserId(1));
        let fd = fired_timer(&h.server, TimerKind::Session(sid));
        h.server.sessions().set_timer(sid, Some(fd));

        // Disarming drops the expiration that already happened.
        h.server.stop_session_timer(sid);
        dispatch(&h.server, fd, sys::EV_IN);
        assert!(h.server.sessions().get(sid).is_some());
        assert_eq!(h.server.close_cancelled_timers(), 1);
    }

    #[test]
    fn test_stale_timer_spares_resumed_session() {
        let h = Harness::new();
        let sid = h.server.sessions().create(UserId(1));
        let fd = fired_timer(&h.server, TimerKind::Session(sid));

        dispatch(&h.server, fd, sys::EV_IN);
        assert!(h.server.sessions().get(sid).is_some());
        assert!(h.server.events().lookup(fd).is_none());
    }
}
