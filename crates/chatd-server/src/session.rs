//! Resumable login sessions.
//!
//! A session outlives its connection: when the client goes away a timer
//! starts, and the session is dropped when it fires unless a new
//! connection resumes it first.

use std::os::unix::io::RawFd;

use chatd_core::{ConcurrentMap, UserId};
use rand::Rng;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: u32,
    pub user_id: UserId,
    /// Expiry timer, armed only while no client holds the session.
    pub timer: Option<RawFd>,
}

pub struct SessionStore {
    map: ConcurrentMap<Session>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            map: ConcurrentMap::new(32),
        }
    }

    /// New session with a random nonzero id.
    pub fn create(&self, user_id: UserId) -> u32 {
        let mut rng = rand::thread_rng();
        loop {
            let id = rng.gen_range(1..=u32::MAX);
            let session = Session {
                id,
                user_id,
                timer: None,
            };
            if self.map.insert(id as u64, session).is_ok() {
                return id;
            }
        }
    }

    pub fn get(&self, id: u32) -> Option<Session> {
        self.map.get(id as u64)
    }

    pub fn remove(&self, id: u32) -> Option<Session> {
        self.map.remove(id as u64)
    }

    /// Replace the timer, returning the previous one.
    pub fn set_timer(&self, id: u32, timer: Option<RawFd>) -> Option<RawFd> {
        self.map
            .update(id as u64, |s| std::mem::replace(&mut s.timer, timer))
            .flatten()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_expire() {
        let store = SessionStore::new();
        let a = store.create(UserId(1));
        let b = store.create(UserId(1));
        assert_ne!(a, 0);
        assert_ne!(a, b);
        assert_eq!(store.get(a).unwrap().user_id, UserId(1));

        assert_eq!(store.set_timer(a, Some(42)), None);
        assert_eq!(store.set_timer(a, None), Some(42));
        assert_eq!(store.set_timer(999, Some(1)), None);

        assert!(store.remove(a).is_some());
        assert!(store.get(a).is_none());
        assert_eq!(store.len(), 1);
    }
}
