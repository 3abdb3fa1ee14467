//! PostgreSQL frontend driver in pipeline mode.
//!
//! ```text
//!   send_query ─► Parse/Bind/Describe/Execute ─┐
//!   pipeline_sync ─► Sync ─────────────────────┤ wbuf ─► socket (non-blocking)
//!   send_flush ─► Flush ───────────────────────┘
//!
//!   socket ─► rbuf ─► codec::decode ─► ResultAssembler ─► next_result
//! ```
//!
//! The startup handshake runs blocking; after ReadyForQuery the socket is
//! switched to non-blocking and only driven by the worker.

pub mod assembler;
pub mod auth;
pub mod codec;
pub mod conninfo;
pub mod error;

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use chatd_pipeline::{DbResult, Param, PipelineDriver};
use tracing::{debug, info, trace, warn};

pub use assembler::ResultAssembler;
pub use conninfo::{ConnConfig, Target};
pub use error::{PgError, Result};

use codec::{AuthRequest, BackendMessage};

const READ_CHUNK: usize = 16 * 1024;

enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    fn open(target: &Target) -> io::Result<Self> {
        match target {
            Target::Tcp { host, port } => {
                let s = TcpStream::connect((host.as_str(), *port))?;
                s.set_nodelay(true)?;
                Ok(Self::Tcp(s))
            }
            Target::Unix(path) => Ok(Self::Unix(UnixStream::connect(path)?)),
        }
    }

    fn set_nonblocking(&self, on: bool) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.set_nonblocking(on),
            Self::Unix(s) => s.set_nonblocking(on),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            Self::Unix(s) => s.flush(),
        }
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Tcp(s) => s.as_raw_fd(),
            Self::Unix(s) => s.as_raw_fd(),
        }
    }
}

/// One pipelined connection.
pub struct PgDriver {
    config: ConnConfig,
    stream: Option<Stream>,
    rbuf: Vec<u8>,
    wbuf: Vec<u8>,
    wpos: usize,
    assembler: ResultAssembler,
    backend_pid: i32,
}

impl PgDriver {
    /// Connect and authenticate using a libpq-style connection string.
    pub fn connect(conninfo: &str) -> Result<Self> {
        let config = ConnConfig::parse(conninfo)?;
        let mut driver = Self {
            config,
            stream: None,
            rbuf: Vec::with_capacity(READ_CHUNK),
            wbuf: Vec::with_capacity(READ_CHUNK),
            wpos: 0,
            assembler: ResultAssembler::new(),
            backend_pid: 0,
        };
        driver.open()?;
        Ok(driver)
    }

    pub fn config(&self) -> &ConnConfig {
        &self.config
    }

    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    fn open(&mut self) -> Result<()> {
        let target = self.config.target();
        let mut stream = Stream::open(&target)?;
        let mut buf = Vec::new();
        codec::startup(
            &mut buf,
            &[
                ("user", &self.config.user),
                ("database", &self.config.dbname),
                ("application_name", &self.config.application_name),
                ("client_encoding", "UTF8"),
            ],
        );
        stream.write_all(&buf)?;

        self.rbuf.clear();
        self.wbuf.clear();
        self.wpos = 0;
        self.assembler.reset();

        loop {
            match self.read_blocking(&mut stream)? {
                BackendMessage::Authentication(req) => self.authenticate(&mut stream, req)?,
                BackendMessage::BackendKeyData { pid, .. } => self.backend_pid = pid,
                BackendMessage::ParameterStatus { name, value } => {
                    trace!(%name, %value, "parameter status");
                }
                BackendMessage::Error(f) => {
                    return Err(PgError::Server {
                        severity: f.severity,
                        code: f.code,
                        message: f.message,
                    })
                }
                BackendMessage::ReadyForQuery(_) => break,
                other => debug!(?other, "ignored during startup"),
            }
        }

        stream.set_nonblocking(true)?;
        info!(
            target_addr = ?target,
            dbname = %self.config.dbname,
            pid = self.backend_pid,
            "database connected"
        );
        self.stream = Some(stream);
        Ok(())
    }

    fn authenticate(&mut self, stream: &mut Stream, req: AuthRequest) -> Result<()> {
        let reply = match req {
            AuthRequest::Ok => return Ok(()),
            AuthRequest::Cleartext => self.password()?.to_string(),
            AuthRequest::Md5(salt) => auth::md5_password(&self.config.user, self.password()?, salt),
            AuthRequest::Other(code) => return Err(PgError::UnsupportedAuth(code)),
        };
        let mut buf = Vec::new();
        codec::password(&mut buf, &reply);
        stream.write_all(&buf)?;
        Ok(())
    }

    fn password(&self) -> Result<&str> {
        self.config
            .password
            .as_deref()
            .ok_or_else(|| PgError::Auth("server requested a password but none is configured".into()))
    }

    /// Read until one whole message is buffered. Startup only.
    fn read_blocking(&mut self, stream: &mut Stream) -> Result<BackendMessage> {
        loop {
            if let Some((msg, used)) = codec::decode(&self.rbuf)? {
                self.rbuf.drain(..used);
                return Ok(msg);
            }
            let mut chunk = [0u8; READ_CHUNK];
            let n = stream.read(&mut chunk)?;
            if n == 0 {
                return Err(PgError::Closed);
            }
            self.rbuf.extend_from_slice(&chunk[..n]);
        }
    }

    fn stream_mut(&mut self) -> Result<&mut Stream> {
        self.stream.as_mut().ok_or(PgError::Closed)
    }

    /// Write as much buffered output as the socket takes.
    fn write_pending(&mut self) -> Result<bool> {
        while self.wpos < self.wbuf.len() {
            let Some(stream) = self.stream.as_mut() else {
                return Err(PgError::Closed);
            };
            match stream.write(&self.wbuf[self.wpos..]) {
                Ok(0) => return Err(PgError::Closed),
                Ok(n) => self.wpos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.wbuf.clear();
        self.wpos = 0;
        Ok(true)
    }

    fn read_available(&mut self) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let stream = self.stream_mut()?;
            match stream.read(&mut chunk) {
                Ok(0) => {
                    self.assembler.connection_lost("server closed the connection");
                    self.stream = None;
                    return Ok(());
                }
                Ok(n) => self.rbuf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn parse_buffered(&mut self) {
        let mut pos = 0;
        loop {
            match codec::decode(&self.rbuf[pos..]) {
                Ok(Some((msg, used))) => {
                    pos += used;
                    self.assembler.feed(msg);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "undecodable backend message");
                    self.assembler.connection_lost(&e.to_string());
                    pos = self.rbuf.len();
                    break;
                }
            }
        }
        self.rbuf.drain(..pos);
    }
}

impl PipelineDriver for PgDriver {
    fn send_query(&mut self, sql: &str, params: &[Param]) -> chatd_pipeline::Result<()> {
        if self.stream.is_none() {
            return Err(PgError::Closed.into());
        }
        codec::parse(&mut self.wbuf, sql, params.len());
        codec::bind(&mut self.wbuf, params);
        codec::describe_portal(&mut self.wbuf);
        codec::execute(&mut self.wbuf);
        self.assembler.expect_query();
        Ok(())
    }

    fn pipeline_sync(&mut self) -> chatd_pipeline::Result<()> {
        codec::sync(&mut self.wbuf);
        self.assembler.expect_sync();
        self.write_pending()?;
        Ok(())
    }

    fn send_flush(&mut self) -> chatd_pipeline::Result<()> {
        codec::flush(&mut self.wbuf);
        self.write_pending()?;
        Ok(())
    }

    fn consume_input(&mut self) -> chatd_pipeline::Result<()> {
        if self.wants_write() {
            self.write_pending()?;
        }
        if let Err(e) = self.read_available() {
            self.assembler.connection_lost(&e.to_string());
            self.stream = None;
        }
        self.parse_buffered();
        if self.assembler.needs_sync() {
            debug!("statement failed inside a flushed segment, sending sync");
            self.pipeline_sync()?;
        }
        Ok(())
    }

    fn next_result(&mut self) -> Option<DbResult> {
        self.assembler.pop_result()
    }

    fn socket(&self) -> RawFd {
        self.stream.as_ref().map_or(-1, AsRawFd::as_raw_fd)
    }

    fn reconnect(&mut self) -> chatd_pipeline::Result<()> {
        self.stream = None;
        self.open()?;
        Ok(())
    }

    fn wants_write(&self) -> bool {
        self.wpos < self.wbuf.len()
    }

    fn flush_output(&mut self) -> chatd_pipeline::Result<bool> {
        Ok(self.write_pending()?)
    }
}

impl Drop for PgDriver {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            let mut buf = Vec::new();
            codec::terminate(&mut buf);
            let _ = stream.write(&buf);
        }
    }
}
