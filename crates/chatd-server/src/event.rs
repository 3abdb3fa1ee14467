//! Event registry: fd → registration, mirrored into epoll.
//!
//! ```text
//!   register:   map.insert ──► epoll ADD      (either fails → roll back)
//!   unregister: epoll DEL ──► close_cb(data) ──► map.remove
//! ```
//!
//! A registration owns whatever owns the fd (socket, timer, ...), so the
//! descriptor number cannot be recycled while any job still holds an
//! `Arc<Registration>`. Each registration is torn down at most once.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chatd_core::ConcurrentMap;
use tracing::{error, trace, warn};

use crate::error::{Result, ServerError};
use crate::sys::{self, Epoll, EpollEvent};

/// Where a descriptor's read callback runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// On the dispatcher thread, level-triggered.
    Inline,
    /// On a worker, one-shot; re-armed after each job.
    Worker,
}

impl Mode {
    pub fn epoll_flags(self) -> u32 {
        match self {
            Mode::Inline => sys::EV_IN,
            Mode::Worker => sys::EV_IN | sys::EV_RDHUP | sys::EV_ONESHOT,
        }
    }
}

/// What a read callback wants done with its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Keep,
    Close,
}

pub struct Registration<D> {
    fd: RawFd,
    mode: Mode,
    closed: AtomicBool,
    data: D,
}

impl<D> Registration<D> {
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    #[inline]
    pub fn data(&self) -> &D {
        &self.data
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

pub struct EventRegistry<D> {
    epoll: Arc<Epoll>,
    map: ConcurrentMap<Arc<Registration<D>>>,
}

impl<D> EventRegistry<D> {
    pub fn new(size: usize) -> Result<Self> {
        Ok(Self {
            epoll: Arc::new(Epoll::new()?),
            map: ConcurrentMap::new(size),
        })
    }

    /// Register `fd`. A second registration of a live fd fails and leaves
    /// the first untouched.
    pub fn register(&self, fd: RawFd, mode: Mode, data: D) -> Result<Arc<Registration<D>>> {
        let reg = Arc::new(Registration {
            fd,
            mode,
            closed: AtomicBool::new(false),
            data,
        });
        if self.map.insert(fd as u64, Arc::clone(&reg)).is_err() {
            error!(fd, "fd registered twice");
            return Err(ServerError::AlreadyRegistered(fd));
        }
        if let Err(e) = self.epoll.add(fd, mode.epoll_flags()) {
            self.map.remove(fd as u64);
            warn!(fd, error = %e, "epoll add failed");
            return Err(e.into());
        }
        trace!(fd, ?mode, "registered");
        Ok(reg)
    }

    /// The epoll set, for owners that change their own interest (a client
    /// with output waiting adds `EV_OUT`).
    pub fn epoll(&self) -> Arc<Epoll> {
        Arc::clone(&self.epoll)
    }

    pub fn lookup(&self, fd: RawFd) -> Option<Arc<Registration<D>>> {
        self.map.get(fd as u64)
    }

    /// Re-arm a one-shot registration after its job ran.
    pub fn rearm(&self, reg: &Registration<D>) -> Result<()> {
        if reg.is_closed() {
            return Ok(());
        }
        self.epoll.modify(reg.fd, reg.mode.epoll_flags())?;
        Ok(())
    }

    /// Tear `reg` down. `close_cb` runs between epoll removal and map
    /// removal. Returns `false` if it was already torn down.
    pub fn unregister<F>(&self, reg: &Arc<Registration<D>>, close_cb: F) -> bool
    where
        F: FnOnce(&D),
    {
        if reg.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Err(e) = self.epoll.delete(reg.fd) {
            trace!(fd = reg.fd, error = %e, "epoll del");
        }
        close_cb(&reg.data);

        // Only drop the map entry if it is still ours.
        let ours = self
            .map
            .with(reg.fd as u64, |cur| Arc::ptr_eq(cur, reg))
            .unwrap_or(false);
        if ours {
            self.map.delete(reg.fd as u64);
        }
        trace!(fd = reg.fd, "unregistered");
        true
    }

    pub fn unregister_fd<F>(&self, fd: RawFd, close_cb: F) -> bool
    where
        F: FnOnce(&D),
    {
        match self.lookup(fd) {
            Some(reg) => self.unregister(&reg, close_cb),
            None => false,
        }
    }

    pub fn wait(&self, events: &mut [EpollEvent], timeout_ms: i32) -> Result<usize> {
        Ok(self.epoll.wait(events, timeout_ms)?)
    }

    /// Every live registration.
    pub fn snapshot(&self) -> Vec<Arc<Registration<D>>> {
        let mut out = Vec::with_capacity(self.map.len());
        self.map.for_each(|_, reg| out.push(Arc::clone(reg)));
        out
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::EventFd;
    use std::os::unix::io::AsRawFd;
    use std::sync::atomic::AtomicUsize;

    struct Tagged {
        efd: EventFd,
        tag: &'static str,
    }

    fn tagged(tag: &'static str) -> Tagged {
        Tagged {
            efd: EventFd::new().unwrap(),
            tag,
        }
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let reg: EventRegistry<Tagged> = EventRegistry::new(8).unwrap();
        let first = tagged("first");
        let fd = first.efd.as_raw_fd();
        reg.register(fd, Mode::Inline, first).unwrap();

        let Err(err) = reg.register(fd, Mode::Worker, tagged("second")) else {
            panic!("second registration of fd {fd} succeeded");
        };
        assert!(matches!(err, ServerError::AlreadyRegistered(f) if f == fd));

        let live = reg.lookup(fd).unwrap();
        assert_eq!(live.data().tag, "first");
        assert_eq!(live.mode(), Mode::Inline);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_unregister_runs_close_once() {
        let reg: EventRegistry<Tagged> = EventRegistry::new(8).unwrap();
        let p = tagged("x");
        let fd = p.efd.as_raw_fd();
        let handle = reg.register(fd, Mode::Worker, p).unwrap();

        let closes = AtomicUsize::new(0);
        assert!(reg.unregister(&handle, |_| {
            closes.fetch_add(1, Ordering::Relaxed);
        }));
        assert!(!reg.unregister(&handle, |_| {
            closes.fetch_add(1, Ordering::Relaxed);
        }));
        assert!(!reg.unregister_fd(fd, |_| {
            closes.fetch_add(1, Ordering::Relaxed);
        }));
        assert_eq!(closes.load(Ordering::Relaxed), 1);
        assert!(handle.is_closed());
        assert!(reg.lookup(fd).is_none());
    }

    #[test]
    fn test_map_entry_visible_during_close() {
        let reg: EventRegistry<Tagged> = EventRegistry::new(8).unwrap();
        let p = tagged("x");
        let fd = p.efd.as_raw_fd();
        let handle = reg.register(fd, Mode::Inline, p).unwrap();
        let mut seen = false;
        reg.unregister(&handle, |_| seen = reg.lookup(fd).is_some());
        assert!(seen);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_readiness_reaches_wait() {
        let reg: EventRegistry<Tagged> = EventRegistry::new(8).unwrap();
        let p = tagged("x");
        let fd = p.efd.as_raw_fd();
        let handle = reg.register(fd, Mode::Worker, p).unwrap();
        handle.data().efd.notify().unwrap();

        let mut events = sys::empty_events(4);
        assert_eq!(reg.wait(&mut events, 100).unwrap(), 1);
        // One-shot: silent until re-armed
        assert_eq!(reg.wait(&mut events, 0).unwrap(), 0);
        reg.rearm(&handle).unwrap();
        assert_eq!(reg.wait(&mut events, 100).unwrap(), 1);
    }
}
