//! Identifier newtypes.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Connection identity, the weak owner reference carried by in-flight
/// database commands.
///
/// Ids come from a monotonically increasing counter and are never reused,
/// so resolving a stale id can only fail; it cannot reach a newer
/// connection that happens to sit on a recycled file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ClientId(pub u64);

impl ClientId {
    pub const NONE: Self = Self(0);

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// Hands out [`ClientId`]s starting at 1.
#[derive(Debug)]
pub struct ClientIdAllocator {
    next: AtomicU64,
}

impl ClientIdAllocator {
    pub const fn new() -> Self {
        Self { next: AtomicU64::new(1) }
    }

    pub fn next_id(&self) -> ClientId {
        ClientId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ClientIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Database user id (`Users.user_id`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct UserId(pub u32);

impl UserId {
    #[inline]
    pub fn as_key(self) -> u64 {
        self.0 as u64
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocator_never_reuses() {
        let alloc = ClientIdAllocator::new();
        let a = alloc.next_id();
        let b = alloc.next_id();
        assert_ne!(a, b);
        assert!(!a.is_none());
        assert!(b > a);
    }

    #[test]
    fn test_display() {
        assert_eq!(ClientId(7).to_string(), "client#7");
        assert_eq!(UserId(3).to_string(), "3");
    }
}
