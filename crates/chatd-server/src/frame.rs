//! Length-prefixed frames.
//!
//! ```text
//!   +----------------+---------------------------+
//!   | len: u32 (BE)  | payload: len bytes (JSON) |
//!   +----------------+---------------------------+
//! ```

use serde_json::Value;

use crate::error::{Result, ServerError};

pub const HEADER_LEN: usize = 4;

pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn encode_json(value: &Value) -> Vec<u8> {
    encode(value.to_string().as_bytes())
}

/// Accumulates partial reads and yields whole frames.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    max_frame: usize,
}

impl FrameBuffer {
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete payload, `None` if more bytes are needed.
    ///
    /// An oversized length prefix is an error as soon as the header is
    /// seen; the connection should be dropped.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > self.max_frame {
            return Err(ServerError::FrameTooLarge {
                size: len,
                limit: self.max_frame,
            });
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        let payload = self.buf[HEADER_LEN..HEADER_LEN + len].to_vec();
        self.buf.drain(..HEADER_LEN + len);
        Ok(Some(payload))
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_delivery_yields_one_frame() {
        let wire = encode_json(&json!({"cmd": "login", "username": "ann"}));
        let mut fb = FrameBuffer::new(1024);
        for chunk in wire.chunks(3) {
            fb.extend(chunk);
        }
        let got = fb.next_frame().unwrap().unwrap();
        let v: Value = serde_json::from_slice(&got).unwrap();
        assert_eq!(v["cmd"], "login");
        assert!(fb.next_frame().unwrap().is_none());
        assert_eq!(fb.buffered(), 0);
    }

    #[test]
    fn test_partial_header_and_body() {
        let wire = encode(b"hello");
        let mut fb = FrameBuffer::new(64);
        fb.extend(&wire[..2]);
        assert!(fb.next_frame().unwrap().is_none());
        fb.extend(&wire[2..6]);
        assert!(fb.next_frame().unwrap().is_none());
        fb.extend(&wire[6..]);
        assert_eq!(fb.next_frame().unwrap().unwrap(), b"hello");
    }

    #[test]
    fn test_two_frames_in_one_read() {
        let mut wire = encode(b"a");
        wire.extend(encode(b"bc"));
        let mut fb = FrameBuffer::new(64);
        fb.extend(&wire);
        assert_eq!(fb.next_frame().unwrap().unwrap(), b"a");
        assert_eq!(fb.next_frame().unwrap().unwrap(), b"bc");
        assert!(fb.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_oversize_rejected() {
        let mut fb = FrameBuffer::new(8);
        fb.extend(&100u32.to_be_bytes());
        assert!(matches!(
            fb.next_frame(),
            Err(ServerError::FrameTooLarge { size: 100, limit: 8 })
        ));
    }
}
