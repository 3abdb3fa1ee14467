//! Connected clients and the registry that resolves weak owner ids.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use chatd_core::{ClientId, ClientIdAllocator, ConcurrentMap, UserId};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::db::model::User;
use crate::error::Result;
use crate::event::Mode;
use crate::frame::{self, FrameBuffer};
use crate::sys::{self, Epoll};

const READ_CHUNK: usize = 16 * 1024;
/// Unsent output a client may hold, in units of the frame limit.
const OUTBOX_FRAMES: usize = 4;

struct ClientState {
    frames: FrameBuffer,
    user: Option<User>,
    session_id: Option<u32>,
}

/// Outgoing bytes not yet taken by the socket, always whole frames from
/// the first unsent byte on. `in_job` is set by the dispatcher while a
/// worker owns the one-shot registration.
struct Outbox {
    buf: Vec<u8>,
    limit: usize,
    in_job: bool,
    dead: bool,
    epoll: Option<Arc<Epoll>>,
}

/// What one readable event produced.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    pub frames: Vec<Vec<u8>>,
    pub eof: bool,
}

pub struct Client {
    id: ClientId,
    fd: OwnedFd,
    peer: String,
    state: Mutex<ClientState>,
    out: Mutex<Outbox>,
}

impl Client {
    pub fn new(id: ClientId, fd: OwnedFd, peer: impl Into<String>, max_frame: usize) -> Self {
        Self {
            id,
            fd,
            peer: peer.into(),
            state: Mutex::new(ClientState {
                frames: FrameBuffer::new(max_frame),
                user: None,
                session_id: None,
            }),
            out: Mutex::new(Outbox {
                buf: Vec::new(),
                limit: max_frame.saturating_mul(OUTBOX_FRAMES),
                in_job: false,
                dead: false,
                epoll: None,
            }),
        }
    }

    /// Let the client change its own epoll interest. Call before the
    /// socket is registered.
    pub fn attach(&self, epoll: Arc<Epoll>) {
        self.out.lock().epoll = Some(epoll);
    }

    #[inline]
    pub fn id(&self) -> ClientId {
        self.id
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn user(&self) -> Option<User> {
        self.state.lock().user.clone()
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.state.lock().user.as_ref().map(|u| u.user_id)
    }

    pub fn is_logged_in(&self) -> bool {
        self.state.lock().user.is_some()
    }

    pub fn set_user(&self, user: User) {
        self.state.lock().user = Some(user);
    }

    pub fn update_user<R>(&self, f: impl FnOnce(&mut User) -> R) -> Option<R> {
        self.state.lock().user.as_mut().map(f)
    }

    pub fn session_id(&self) -> Option<u32> {
        self.state.lock().session_id
    }

    pub fn set_session_id(&self, id: Option<u32>) {
        self.state.lock().session_id = id;
    }

    /// Drain the socket into the frame buffer and split off whole frames.
    /// A socket error or an oversized frame means the client must go.
    pub fn read_frames(&self) -> Result<ReadOutcome> {
        let mut out = ReadOutcome::default();
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut state = self.state.lock();
        loop {
            match sys::read_nb(self.fd(), &mut chunk)? {
                Some(0) => {
                    out.eof = true;
                    break;
                }
                Some(n) => state.frames.extend(&chunk[..n]),
                None => break,
            }
        }
        while let Some(frame) = state.frames.next_frame()? {
            out.frames.push(frame);
        }
        trace!(client = %self.id, frames = out.frames.len(), eof = out.eof, "read");
        Ok(out)
    }

    /// Queue one JSON frame and push as much as the socket takes without
    /// waiting. The rest goes out on `EV_OUT`. Overflowing the outbox
    /// shuts the connection down rather than drop part of a frame.
    pub fn send_json(&self, value: &Value) -> io::Result<()> {
        let bytes = frame::encode_json(value);
        let mut out = self.out.lock();
        if out.dead {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client is closing"));
        }
        let was_idle = out.buf.is_empty();
        out.buf.extend_from_slice(&bytes);
        if was_idle {
            self.write_out(&mut out)?;
        }
        if out.buf.len() > out.limit {
            let pending = out.buf.len();
            self.kill(&mut out);
            warn!(client = %self.id, pending, "peer not reading, dropping connection");
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "outbox full"));
        }
        if was_idle && !out.buf.is_empty() && !out.in_job {
            self.arm(&out);
        }
        Ok(())
    }

    /// Push buffered output. Called on `EV_OUT`.
    pub fn flush(&self) -> io::Result<()> {
        let mut out = self.out.lock();
        if out.dead {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client is closing"));
        }
        self.write_out(&mut out)
    }

    /// Bytes queued but not yet accepted by the socket.
    pub fn pending_output(&self) -> usize {
        self.out.lock().buf.len()
    }

    pub fn is_dead(&self) -> bool {
        self.out.lock().dead
    }

    /// Claim the registration for one job. `false` if a job already holds
    /// it (a stale or duplicate event).
    pub fn begin_job(&self) -> bool {
        let mut out = self.out.lock();
        if out.in_job {
            return false;
        }
        out.in_job = true;
        true
    }

    /// Release the registration and re-arm it, asking for `EV_OUT` while
    /// output is waiting.
    pub fn end_job(&self) -> io::Result<()> {
        let mut out = self.out.lock();
        out.in_job = false;
        if out.dead {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client is closing"));
        }
        match &out.epoll {
            Some(epoll) => epoll.modify(self.fd(), interest(&out)),
            None => Ok(()),
        }
    }

    fn write_out(&self, out: &mut Outbox) -> io::Result<()> {
        let mut sent = 0;
        while sent < out.buf.len() {
            match sys::send_nb(self.fd(), &out.buf[sent..]) {
                Ok(Some(0)) | Ok(None) => break,
                Ok(Some(n)) => sent += n,
                Err(e) => {
                    self.kill(out);
                    return Err(e);
                }
            }
        }
        out.buf.drain(..sent);
        trace!(client = %self.id, sent, pending = out.buf.len(), "write");
        Ok(())
    }

    /// Outside a job the registration may be armed for input only.
    fn arm(&self, out: &Outbox) {
        if let Some(epoll) = &out.epoll {
            if let Err(e) = epoll.modify(self.fd(), interest(out)) {
                trace!(client = %self.id, error = %e, "arm for output");
            }
        }
    }

    /// Stop sending for good. The peer sees EOF after the last complete
    /// write and the close path runs on the HUP that follows.
    fn kill(&self, out: &mut Outbox) {
        out.dead = true;
        out.buf = Vec::new();
        if let Err(e) = sys::shutdown(self.fd()) {
            debug!(client = %self.id, error = %e, "shutdown");
        }
    }
}

fn interest(out: &Outbox) -> u32 {
    let mut flags = Mode::Worker.epoll_flags();
    if !out.buf.is_empty() {
        flags |= sys::EV_OUT;
    }
    flags
}

/// Every live client, by connection id and by logged-in user.
pub struct ClientRegistry {
    ids: ClientIdAllocator,
    by_id: ConcurrentMap<Arc<Client>>,
    by_user: ConcurrentMap<ClientId>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            ids: ClientIdAllocator::new(),
            by_id: ConcurrentMap::new(64),
            by_user: ConcurrentMap::new(64),
        }
    }

    pub fn next_id(&self) -> ClientId {
        self.ids.next_id()
    }

    pub fn insert(&self, client: Arc<Client>) -> bool {
        self.by_id.insert(client.id().as_u64(), client).is_ok()
    }

    pub fn get(&self, id: ClientId) -> Option<Arc<Client>> {
        self.by_id.get(id.as_u64())
    }

    /// Drop `id` and its user binding.
    pub fn remove(&self, id: ClientId) -> Option<Arc<Client>> {
        let client = self.by_id.remove(id.as_u64())?;
        if let Some(uid) = client.user_id() {
            self.unbind_user(uid, id);
        }
        Some(client)
    }

    /// Mark `user` online on `client`. Fails with the current holder if the
    /// user is already bound elsewhere.
    pub fn bind_user(&self, user: UserId, client: ClientId) -> std::result::Result<(), ClientId> {
        match self.by_user.insert(user.as_key(), client) {
            Ok(()) => Ok(()),
            Err(_) => Err(self.by_user.get(user.as_key()).unwrap_or(ClientId::NONE)),
        }
    }

    /// Remove the binding only if it still points at `client`.
    pub fn unbind_user(&self, user: UserId, client: ClientId) -> bool {
        let ours = self.by_user.with(user.as_key(), |c| *c == client).unwrap_or(false);
        ours && self.by_user.delete(user.as_key())
    }

    pub fn for_user(&self, user: UserId) -> Option<Arc<Client>> {
        let id = self.by_user.get(user.as_key())?;
        self.get(id)
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.by_user.contains(user.as_key())
    }

    /// Resolve a weak owner and send. `false` if the client is gone or the
    /// write failed.
    pub fn send_to(&self, id: ClientId, value: &Value) -> bool {
        match self.get(id) {
            Some(client) => deliver(&client, value),
            None => {
                debug!(client = %id, "owner gone, response dropped");
                false
            }
        }
    }

    pub fn send_to_user(&self, user: UserId, value: &Value) -> bool {
        match self.for_user(user) {
            Some(client) => deliver(&client, value),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn deliver(client: &Client, value: &Value) -> bool {
    match client.send_json(value) {
        Ok(()) => true,
        Err(e) => {
            debug!(client = %client.id(), error = %e, "send failed");
            false
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Read;
    use std::os::unix::net::UnixStream;

    /// A client on one end of a socketpair; the other end plays the peer.
    pub(crate) fn socket_client(id: u64) -> (Arc<Client>, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let client = Client::new(ClientId(id), OwnedFd::from(ours), "test", 1 << 20);
        (Arc::new(client), theirs)
    }

    /// Read every frame currently waiting on the peer end.
    pub(crate) fn recv_frames(peer: &mut UnixStream) -> Vec<Value> {
        peer.set_nonblocking(true).unwrap();
        let mut raw = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match peer.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => raw.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
        }
        let mut fb = FrameBuffer::new(1 << 20);
        fb.extend(&raw);
        let mut out = Vec::new();
        while let Some(f) = fb.next_frame().unwrap() {
            out.push(serde_json::from_slice(&f).unwrap());
        }
        out
    }

    pub(crate) fn user(id: u32, name: &str) -> User {
        User {
            user_id: UserId(id),
            username: name.to_string(),
            displayname: name.to_string(),
            bio: String::new(),
            created_at: String::new(),
            pfp_hash: None,
            hash: Vec::new(),
            salt: Vec::new(),
        }
    }

    #[test]
    fn test_send_and_read_frames() {
        let (client, mut peer) = socket_client(1);
        client.send_json(&json!({"cmd": "ping"})).unwrap();
        let got = recv_frames(&mut peer);
        assert_eq!(got, vec![json!({"cmd": "ping"})]);

        use std::io::Write;
        let wire = frame::encode(br#"{"cmd":"login"}"#);
        peer.write_all(&wire[..5]).unwrap();
        assert!(client.read_frames().unwrap().frames.is_empty());
        peer.write_all(&wire[5..]).unwrap();
        let out = client.read_frames().unwrap();
        assert_eq!(out.frames.len(), 1);
        assert!(!out.eof);

        drop(peer);
        assert!(client.read_frames().unwrap().eof);
    }

    #[test]
    fn test_user_binding() {
        let reg = ClientRegistry::new();
        let (a, _pa) = socket_client(reg.next_id().0);
        let (b, _pb) = socket_client(reg.next_id().0);
        assert_ne!(a.id(), b.id());
        reg.insert(Arc::clone(&a));
        reg.insert(Arc::clone(&b));

        a.set_user(user(7, "ann"));
        assert!(reg.bind_user(UserId(7), a.id()).is_ok());
        assert_eq!(reg.bind_user(UserId(7), b.id()), Err(a.id()));
        assert!(!reg.unbind_user(UserId(7), b.id()));
        assert_eq!(reg.for_user(UserId(7)).unwrap().id(), a.id());

        reg.remove(a.id());
        assert!(!reg.is_online(UserId(7)));
        assert!(reg.get(a.id()).is_none());
        assert!(!reg.send_to(a.id(), &json!({})));
        assert_eq!(reg.len(), 1);
    }

    fn big_message(len: usize) -> Value {
        json!({"cmd": "recv_msg", "content": "x".repeat(len)})
    }

    #[test]
    fn test_slow_peer_gets_whole_frames_in_order() {
        let (client, mut peer) = socket_client(1);
        let big = big_message(2 << 20);
        let small = json!({"cmd": "ping"});
        client.send_json(&big).unwrap();
        assert!(client.pending_output() > 0);
        client.send_json(&small).unwrap();

        peer.set_nonblocking(true).unwrap();
        let mut raw = Vec::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match peer.read(&mut buf) {
                Ok(n) => {
                    assert!(n > 0, "peer saw EOF");
                    raw.extend_from_slice(&buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if client.pending_output() == 0 {
                        break;
                    }
                    client.flush().unwrap();
                }
                Err(e) => panic!("read: {e}"),
            }
        }

        let mut fb = FrameBuffer::new(4 << 20);
        fb.extend(&raw);
        let mut got: Vec<Value> = Vec::new();
        while let Some(f) = fb.next_frame().unwrap() {
            got.push(serde_json::from_slice(&f).unwrap());
        }
        assert_eq!(got, vec![big, small]);
        assert!(!client.is_dead());
    }

    #[test]
    fn test_outbox_overflow_closes_connection() {
        let (client, mut peer) = socket_client(1);
        let wire_len = frame::encode_json(&big_message(5 << 20)).len();
        let err = client.send_json(&big_message(5 << 20)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert!(client.is_dead());
        assert_eq!(client.pending_output(), 0);
        assert_eq!(
            client.send_json(&json!({"cmd": "ping"})).unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );

        // Whatever made it out is a prefix of the one frame, then EOF.
        peer.set_nonblocking(false).unwrap();
        let mut raw = Vec::new();
        peer.read_to_end(&mut raw).unwrap();
        assert!(raw.len() < wire_len);
    }

    #[test]
    fn test_job_claim_is_exclusive() {
        let (client, _peer) = socket_client(1);
        assert!(client.begin_job());
        assert!(!client.begin_job());
        client.end_job().unwrap();
        assert!(client.begin_job());
        client.end_job().unwrap();
    }

    #[test]
    fn test_pending_output_arms_for_write() {
        let (client, mut peer) = socket_client(1);
        let epoll = Arc::new(Epoll::new().unwrap());
        epoll.add(client.fd(), Mode::Worker.epoll_flags()).unwrap();
        client.attach(Arc::clone(&epoll));

        // Fill the socket so the next frame has to wait.
        client.send_json(&big_message(1 << 20)).unwrap();
        assert!(client.pending_output() > 0);

        peer.set_nonblocking(true).unwrap();
        let mut drain = vec![0u8; 64 * 1024];
        while peer.read(&mut drain).is_ok() {}
        let mut events = sys::empty_events(4);
        let n = epoll.wait(&mut events, 1000).unwrap();
        assert_eq!(n, 1);
        let revents = events[0].events;
        assert_ne!(revents & sys::EV_OUT, 0);

        client.flush().unwrap();
        assert!(client.begin_job());
        client.end_job().unwrap();
    }
}
