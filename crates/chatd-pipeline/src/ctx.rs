//! Command context: one in-flight database operation.

use std::any::Any;
use std::borrow::Cow;
use std::fmt;

use chatd_core::ClientId;

use crate::pipeline::Pipeline;
use crate::result::{DbResult, ResultStatus};

/// Resolution state of a [`Ctx`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Pending,
    Ok,
    Error,
}

/// Data a context carries, either attached by the submitter or produced by
/// its decoder. Owned by exactly one context at a time; move it out with
/// [`Payload::take`] to hand it to another node.
#[derive(Default)]
pub enum Payload {
    #[default]
    Empty,
    /// The result's row set as returned.
    Rows(DbResult),
    Text(String),
    RefCount(i64),
    /// Anything else the caller wants to carry across the round trip.
    Data(Box<dyn Any + Send>),
}

impl Payload {
    pub fn data<T: Any + Send>(value: T) -> Self {
        Self::Data(Box::new(value))
    }

    /// Move the payload out, leaving `Empty` behind.
    pub fn take(&mut self) -> Payload {
        std::mem::take(self)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn rows(&self) -> Option<&DbResult> {
        match self {
            Self::Rows(r) => Some(r),
            _ => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn ref_count(&self) -> Option<i64> {
        match self {
            Self::RefCount(n) => Some(*n),
            _ => None,
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Self::Data(b) => b.downcast_ref(),
            _ => None,
        }
    }

    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        match self {
            Self::Data(b) => b.downcast_mut(),
            _ => None,
        }
    }

    /// Take caller data of type `T`. A payload of another type is left
    /// in place.
    pub fn take_data<T: Any>(&mut self) -> Option<T> {
        match self.take() {
            Self::Data(b) => match b.downcast::<T>() {
                Ok(v) => Some(*v),
                Err(b) => {
                    *self = Self::Data(b);
                    None
                }
            },
            other => {
                *self = other;
                None
            }
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Rows(r) => write!(f, "Rows({} rows)", r.ntuples()),
            Self::Text(s) => f.debug_tuple("Text").field(s).finish(),
            Self::RefCount(n) => f.debug_tuple("RefCount").field(n).finish(),
            Self::Data(_) => f.write_str("Data(..)"),
        }
    }
}

/// Decoder run once when the context's result arrives.
pub type Decode = Box<dyn FnOnce(&DbResult) -> Result<Payload, String> + Send>;

/// Outcome of a continuation. The error text goes to the owner.
pub type ExecResult = Result<(), Cow<'static, str>>;

/// Continuation run when the whole chain has resolved.
///
/// Receives this node and every node after it in the chain, so a head
/// continuation can read the results of the nodes it fanned out.
pub type Exec<E> = Box<dyn FnOnce(&mut E, &mut Pipeline<E>, &mut [Ctx<E>]) -> ExecResult + Send>;

/// Decoder that keeps the row set.
pub fn keep_rows(res: &DbResult) -> Result<Payload, String> {
    Ok(Payload::Rows(res.clone()))
}

/// Decoder for a single integer cell (`RETURNING ref_count`, `SELECT count(*)`).
pub fn first_i64(res: &DbResult) -> Result<Payload, String> {
    res.parse::<i64>(0, 0)
        .map(Payload::RefCount)
        .ok_or_else(|| "expected one integer row".to_string())
}

/// One asynchronous database operation.
pub struct Ctx<E> {
    label: &'static str,
    kind: ResultKind,
    decode: Option<Decode>,
    exec: Option<Exec<E>>,
    payload: Payload,
    owner: Option<ClientId>,
    error: Option<String>,
}

impl<E> Ctx<E> {
    /// Context with no owner; side effects only.
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            kind: ResultKind::Pending,
            decode: None,
            exec: None,
            payload: Payload::Empty,
            owner: None,
            error: None,
        }
    }

    /// Context issued on behalf of a client connection.
    pub fn for_owner(label: &'static str, owner: ClientId) -> Self {
        let mut ctx = Self::new(label);
        ctx.owner = Some(owner);
        ctx
    }

    /// Set the decoder. Its payload replaces whatever was attached.
    pub fn decode<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&DbResult) -> Result<Payload, String> + Send + 'static,
    {
        self.decode = Some(Box::new(f));
        self
    }

    /// Set the continuation.
    pub fn then<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut E, &mut Pipeline<E>, &mut [Ctx<E>]) -> ExecResult + Send + 'static,
    {
        self.exec = Some(Box::new(f));
        self
    }

    /// Attach caller data up front.
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    #[inline]
    pub fn label(&self) -> &'static str {
        self.label
    }

    #[inline]
    pub fn kind(&self) -> ResultKind {
        self.kind
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.kind == ResultKind::Pending
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.kind == ResultKind::Ok
    }

    #[inline]
    pub fn owner(&self) -> Option<ClientId> {
        self.owner
    }

    /// Database or decode error text, if this node failed.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }

    pub(crate) fn take_exec(&mut self) -> Option<Exec<E>> {
        self.exec.take()
    }

    /// Apply the matching raw result. Runs the decoder at most once.
    pub(crate) fn resolve(&mut self, res: &DbResult) {
        let decode = self.decode.take();
        match res.status() {
            ResultStatus::CommandOk | ResultStatus::TuplesOk => match decode {
                Some(decode) => match decode(res) {
                    Ok(payload) => {
                        self.payload = payload;
                        self.kind = ResultKind::Ok;
                    }
                    Err(msg) => {
                        self.error = Some(msg);
                        self.kind = ResultKind::Error;
                    }
                },
                None => self.kind = ResultKind::Ok,
            },
            _ => {
                self.error = Some(res.error_message().unwrap_or("database error").to_string());
                self.kind = ResultKind::Error;
            }
        }
    }
}

impl<E> fmt::Debug for Ctx<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ctx")
            .field("label", &self.label)
            .field("kind", &self.kind)
            .field("owner", &self.owner)
            .field("payload", &self.payload)
            .field("error", &self.error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestCtx = Ctx<()>;

    #[test]
    fn test_resolve_ok_with_decoder() {
        let mut ctx = TestCtx::new("count").decode(first_i64);
        ctx.resolve(&DbResult::single_column("ref_count", &["3"]));
        assert!(ctx.is_ok());
        assert_eq!(ctx.payload().ref_count(), Some(3));
    }

    #[test]
    fn test_resolve_error_keeps_attached_payload() {
        let mut ctx = TestCtx::new("insert").with_payload(Payload::data(vec![1u8, 2, 3]));
        ctx.resolve(&DbResult::error("duplicate key value"));
        assert_eq!(ctx.kind(), ResultKind::Error);
        assert_eq!(ctx.error(), Some("duplicate key value"));
        assert_eq!(ctx.payload_mut().take_data::<Vec<u8>>(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_decoder_failure_is_error() {
        let mut ctx = TestCtx::new("count").decode(first_i64);
        ctx.resolve(&DbResult::tuples(vec!["n".into()], vec![]));
        assert_eq!(ctx.kind(), ResultKind::Error);
        assert!(ctx.payload().is_empty());
    }

    #[test]
    fn test_no_decoder_leaves_payload() {
        let mut ctx = TestCtx::new("update").with_payload(Payload::Text("keep".into()));
        ctx.resolve(&DbResult::command_ok("UPDATE 1"));
        assert!(ctx.is_ok());
        assert_eq!(ctx.payload().text(), Some("keep"));
    }

    #[test]
    fn test_take_data_wrong_type_leaves_payload() {
        let mut p = Payload::data(5u32);
        assert_eq!(p.take_data::<String>(), None);
        assert_eq!(p.downcast_ref::<u32>(), Some(&5));
        assert_eq!(p.take_data::<u32>(), Some(5));
        assert!(p.is_empty());
    }
}
