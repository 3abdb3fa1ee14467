//! Protocol 3.0 message encoding and decoding.
//!
//! Frontend messages are appended to an output buffer. Backend messages
//! are decoded from the front of an input buffer; an incomplete message
//! yields `None` and leaves the buffer alone.

use chatd_pipeline::Param;

use crate::error::{PgError, Result};

pub const PROTOCOL_VERSION: i32 = 196_608;

/// Largest backend message accepted.
const MAX_MESSAGE_LEN: usize = 1 << 30;

// ── Frontend ────────────────────────────────────────────────────────────

fn put_i16(buf: &mut Vec<u8>, v: i16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_cstr(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

/// Write `tag`, a length placeholder, the body, then patch the length.
fn message(buf: &mut Vec<u8>, tag: u8, body: impl FnOnce(&mut Vec<u8>)) {
    buf.push(tag);
    let at = buf.len();
    put_i32(buf, 0);
    body(buf);
    let len = (buf.len() - at) as i32;
    buf[at..at + 4].copy_from_slice(&len.to_be_bytes());
}

pub fn startup(buf: &mut Vec<u8>, params: &[(&str, &str)]) {
    let at = buf.len();
    put_i32(buf, 0);
    put_i32(buf, PROTOCOL_VERSION);
    for (k, v) in params {
        put_cstr(buf, k);
        put_cstr(buf, v);
    }
    buf.push(0);
    let len = (buf.len() - at) as i32;
    buf[at..at + 4].copy_from_slice(&len.to_be_bytes());
}

pub fn password(buf: &mut Vec<u8>, pw: &str) {
    message(buf, b'p', |b| put_cstr(b, pw));
}

/// Parse into the unnamed statement, letting the server infer types.
pub fn parse(buf: &mut Vec<u8>, sql: &str, nparams: usize) {
    message(buf, b'P', |b| {
        put_cstr(b, "");
        put_cstr(b, sql);
        put_i16(b, nparams as i16);
        for _ in 0..nparams {
            put_i32(b, 0);
        }
    });
}

/// Bind the unnamed portal. Byte params go binary, the rest text;
/// results are always text.
pub fn bind(buf: &mut Vec<u8>, params: &[Param]) {
    message(buf, b'B', |b| {
        put_cstr(b, "");
        put_cstr(b, "");
        put_i16(b, params.len() as i16);
        for p in params {
            put_i16(b, i16::from(matches!(p, Param::Bytes(_))));
        }
        put_i16(b, params.len() as i16);
        for p in params {
            match p {
                Param::Null => put_i32(b, -1),
                Param::Text(s) => {
                    put_i32(b, s.len() as i32);
                    b.extend_from_slice(s.as_bytes());
                }
                Param::Bytes(v) => {
                    put_i32(b, v.len() as i32);
                    b.extend_from_slice(v);
                }
            }
        }
        put_i16(b, 0);
    });
}

pub fn describe_portal(buf: &mut Vec<u8>) {
    message(buf, b'D', |b| {
        b.push(b'P');
        put_cstr(b, "");
    });
}

pub fn execute(buf: &mut Vec<u8>) {
    message(buf, b'E', |b| {
        put_cstr(b, "");
        put_i32(b, 0);
    });
}

pub fn sync(buf: &mut Vec<u8>) {
    message(buf, b'S', |_| {});
}

pub fn flush(buf: &mut Vec<u8>) {
    message(buf, b'H', |_| {});
}

pub fn terminate(buf: &mut Vec<u8>) {
    message(buf, b'X', |_| {});
}

// ── Backend ─────────────────────────────────────────────────────────────

/// Fields of an ErrorResponse / NoticeResponse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
}

impl ErrorFields {
    /// The session is over after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self.severity.as_str(), "FATAL" | "PANIC")
    }

    /// `message` plus detail, the way it is shown to operators.
    pub fn describe(&self) -> String {
        match &self.detail {
            Some(d) => format!("{}: {} ({d})", self.severity, self.message),
            None => format!("{}: {}", self.severity, self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRequest {
    Ok,
    Cleartext,
    Md5([u8; 4]),
    Other(i32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    Authentication(AuthRequest),
    ParameterStatus { name: String, value: String },
    BackendKeyData { pid: i32, secret: i32 },
    ReadyForQuery(u8),
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    EmptyQueryResponse,
    RowDescription(Vec<String>),
    DataRow(Vec<Option<String>>),
    CommandComplete(String),
    Error(ErrorFields),
    Notice(ErrorFields),
    /// Anything not needed by the driver (notifications, copy, ...).
    Other(u8),
}

/// Bounds-checked reader over one message body.
struct Body<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Body<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.buf.len())
            .ok_or_else(|| PgError::Protocol("truncated message".into()))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn i16(&mut self) -> Result<i16> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    fn i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn cstr(&mut self) -> Result<String> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&c| c == 0)
            .ok_or_else(|| PgError::Protocol("unterminated string".into()))?;
        let s = String::from_utf8_lossy(&rest[..nul]).into_owned();
        self.pos += nul + 1;
        Ok(s)
    }
}

/// Decode one message from the front of `buf`.
///
/// Returns the message and the bytes it used, or `None` if `buf` does not
/// hold a complete message yet.
pub fn decode(buf: &[u8]) -> Result<Option<(BackendMessage, usize)>> {
    if buf.len() < 5 {
        return Ok(None);
    }
    let tag = buf[0];
    let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if len < 4 || len as usize > MAX_MESSAGE_LEN {
        return Err(PgError::Protocol(format!("bad length {len} for message '{}'", tag as char)));
    }
    let total = 1 + len as usize;
    if buf.len() < total {
        return Ok(None);
    }
    let mut body = Body::new(&buf[5..total]);

    let msg = match tag {
        b'R' => {
            let code = body.i32()?;
            BackendMessage::Authentication(match code {
                0 => AuthRequest::Ok,
                3 => AuthRequest::Cleartext,
                5 => {
                    let s = body.take(4)?;
                    AuthRequest::Md5([s[0], s[1], s[2], s[3]])
                }
                other => AuthRequest::Other(other),
            })
        }
        b'S' => BackendMessage::ParameterStatus {
            name: body.cstr()?,
            value: body.cstr()?,
        },
        b'K' => BackendMessage::BackendKeyData {
            pid: body.i32()?,
            secret: body.i32()?,
        },
        b'Z' => BackendMessage::ReadyForQuery(body.u8()?),
        b'1' => BackendMessage::ParseComplete,
        b'2' => BackendMessage::BindComplete,
        b'3' => BackendMessage::CloseComplete,
        b'n' => BackendMessage::NoData,
        b's' => BackendMessage::PortalSuspended,
        b'I' => BackendMessage::EmptyQueryResponse,
        b'T' => {
            let n = body.i16()?.max(0) as usize;
            let mut names = Vec::with_capacity(n);
            for _ in 0..n {
                names.push(body.cstr()?);
                // table oid, column no, type oid, typlen, typmod, format
                body.take(4 + 2 + 4 + 2 + 4 + 2)?;
            }
            BackendMessage::RowDescription(names)
        }
        b'D' => {
            let n = body.i16()?.max(0) as usize;
            let mut cols = Vec::with_capacity(n);
            for _ in 0..n {
                let len = body.i32()?;
                if len < 0 {
                    cols.push(None);
                } else {
                    let raw = body.take(len as usize)?;
                    cols.push(Some(String::from_utf8_lossy(raw).into_owned()));
                }
            }
            BackendMessage::DataRow(cols)
        }
        b'C' => BackendMessage::CommandComplete(body.cstr()?),
        b'E' => BackendMessage::Error(error_fields(&mut body)?),
        b'N' => BackendMessage::Notice(error_fields(&mut body)?),
        other => BackendMessage::Other(other),
    };
    Ok(Some((msg, total)))
}

fn error_fields(body: &mut Body<'_>) -> Result<ErrorFields> {
    let mut fields = ErrorFields::default();
    let mut localized = String::new();
    loop {
        let kind = body.u8()?;
        if kind == 0 {
            break;
        }
        let value = body.cstr()?;
        match kind {
            b'V' => fields.severity = value,
            b'S' => localized = value,
            b'C' => fields.code = value,
            b'M' => fields.message = value,
            b'D' => fields.detail = Some(value),
            _ => {}
        }
    }
    if fields.severity.is_empty() {
        fields.severity = localized;
    }
    Ok(fields)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Frame a backend message for decoder tests.
    pub(crate) fn backend(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        out.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    pub(crate) fn error_body(severity: &str, code: &str, msg: &str) -> Vec<u8> {
        let mut b = Vec::new();
        for (k, v) in [(b'S', severity), (b'V', severity), (b'C', code), (b'M', msg)] {
            b.push(k);
            b.extend_from_slice(v.as_bytes());
            b.push(0);
        }
        b.push(0);
        b
    }

    #[test]
    fn test_startup_layout() {
        let mut buf = Vec::new();
        startup(&mut buf, &[("user", "bob")]);
        let len = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len());
        assert_eq!(&buf[4..8], &PROTOCOL_VERSION.to_be_bytes());
        assert_eq!(&buf[8..], b"user\0bob\0\0");
    }

    #[test]
    fn test_sync_and_flush() {
        let mut buf = Vec::new();
        sync(&mut buf);
        flush(&mut buf);
        assert_eq!(buf, vec![b'S', 0, 0, 0, 4, b'H', 0, 0, 0, 4]);
    }

    #[test]
    fn test_bind_formats_and_null() {
        let mut buf = Vec::new();
        bind(
            &mut buf,
            &[Param::Text("7".into()), Param::Null, Param::Bytes(vec![0xAB])],
        );
        assert_eq!(buf[0], b'B');
        let body = &buf[5..];
        // portal "", statement ""
        assert_eq!(&body[..2], &[0, 0]);
        // three format codes: text, text, binary
        assert_eq!(&body[2..4], &3i16.to_be_bytes());
        assert_eq!(&body[4..10], &[0, 0, 0, 0, 0, 1]);
        // three values
        assert_eq!(&body[10..12], &3i16.to_be_bytes());
        assert_eq!(&body[12..17], &[0, 0, 0, 1, b'7']);
        assert_eq!(&body[17..21], &(-1i32).to_be_bytes());
        assert_eq!(&body[21..26], &[0, 0, 0, 1, 0xAB]);
        // result formats: none (all text)
        assert_eq!(&body[26..], &[0, 0]);
    }

    #[test]
    fn test_decode_incomplete() {
        let full = backend(b'C', b"INSERT 0 1\0");
        assert_eq!(decode(&full[..3]).unwrap(), None);
        assert_eq!(decode(&full[..full.len() - 1]).unwrap(), None);
        let (msg, used) = decode(&full).unwrap().unwrap();
        assert_eq!(msg, BackendMessage::CommandComplete("INSERT 0 1".into()));
        assert_eq!(used, full.len());
    }

    #[test]
    fn test_decode_row_description_and_data_row() {
        let mut t = Vec::new();
        t.extend_from_slice(&1i16.to_be_bytes());
        t.extend_from_slice(b"ref_count\0");
        t.extend_from_slice(&[0u8; 18]);
        let (msg, _) = decode(&backend(b'T', &t)).unwrap().unwrap();
        assert_eq!(msg, BackendMessage::RowDescription(vec!["ref_count".into()]));

        let mut d = Vec::new();
        d.extend_from_slice(&2i16.to_be_bytes());
        d.extend_from_slice(&1i32.to_be_bytes());
        d.push(b'2');
        d.extend_from_slice(&(-1i32).to_be_bytes());
        let (msg, _) = decode(&backend(b'D', &d)).unwrap().unwrap();
        assert_eq!(msg, BackendMessage::DataRow(vec![Some("2".into()), None]));
    }

    #[test]
    fn test_decode_error_and_auth() {
        let (msg, _) = decode(&backend(b'E', &error_body("ERROR", "23505", "dup")))
            .unwrap()
            .unwrap();
        match msg {
            BackendMessage::Error(f) => {
                assert_eq!(f.code, "23505");
                assert_eq!(f.message, "dup");
                assert!(!f.is_fatal());
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut body = 5i32.to_be_bytes().to_vec();
        body.extend_from_slice(&[1, 2, 3, 4]);
        let (msg, _) = decode(&backend(b'R', &body)).unwrap().unwrap();
        assert_eq!(msg, BackendMessage::Authentication(AuthRequest::Md5([1, 2, 3, 4])));
    }

    #[test]
    fn test_decode_rejects_bad_length() {
        let buf = [b'Z', 0, 0, 0, 2, b'I'];
        assert!(decode(&buf).is_err());
    }

    #[test]
    fn test_decode_truncated_body() {
        // DataRow claims a 10 byte column but carries 1
        let mut d = Vec::new();
        d.extend_from_slice(&1i16.to_be_bytes());
        d.extend_from_slice(&10i32.to_be_bytes());
        d.push(b'x');
        assert!(decode(&backend(b'D', &d)).is_err());
    }
}
