//! Upload tokens: short-lived permits to send file bytes for a pending
//! profile picture or message.

use std::os::unix::io::RawFd;

use chatd_core::{ConcurrentMap, UserId};
use rand::Rng;

use crate::db::model::Attachment;
use crate::files::SavedFile;

/// A message held back until all of its attachments are stored.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub group_id: u32,
    pub content: String,
    /// Declared attachments; `hash` is filled in as each one arrives.
    pub attachments: Vec<Attachment>,
}

impl PendingMessage {
    pub fn received(&self) -> usize {
        self.attachments.iter().filter(|a| a.hash.is_some()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.attachments.iter().all(|a| a.hash.is_some())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadKind {
    UserPfp,
    MsgAttachments(PendingMessage),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadToken {
    pub id: u32,
    pub user_id: UserId,
    pub kind: UploadKind,
    pub timer: Option<RawFd>,
    /// Its last file is in; further uploads are refused.
    pub consumed: bool,
}

/// What storing one file did to its token.
#[derive(Debug, PartialEq)]
pub enum Progress {
    /// Token expired, belongs to someone else, or never existed.
    Unknown,
    /// Name and type match no outstanding attachment.
    NotExpected,
    /// More attachments to go.
    Pending { received: usize, total: usize },
    /// Last attachment in; the token is gone.
    Complete(UploadToken),
    /// Profile picture in; the token is gone.
    Pfp(UploadToken),
}

pub struct UploadStore {
    map: ConcurrentMap<UploadToken>,
}

impl UploadStore {
    pub fn new() -> Self {
        Self {
            map: ConcurrentMap::new(32),
        }
    }

    pub fn create(&self, user_id: UserId, kind: UploadKind) -> u32 {
        let mut rng = rand::thread_rng();
        let mut token = UploadToken {
            id: 0,
            user_id,
            kind,
            timer: None,
            consumed: false,
        };
        loop {
            let id = rng.gen_range(1..=u32::MAX);
            token.id = id;
            match self.map.insert(id as u64, token) {
                Ok(()) => return id,
                Err(back) => token = back,
            }
        }
    }

    pub fn get(&self, id: u32) -> Option<UploadToken> {
        self.map.get(id as u64)
    }

    pub fn remove(&self, id: u32) -> Option<UploadToken> {
        self.map.remove(id as u64)
    }

    /// Whether `id` is live and was issued to `user_id`.
    pub fn is_owned_by(&self, id: u32, user_id: UserId) -> bool {
        self.map
            .with(id as u64, |t| t.user_id == user_id && !t.consumed)
            .unwrap_or(false)
    }

    pub fn set_timer(&self, id: u32, timer: Option<RawFd>) -> Option<RawFd> {
        self.map
            .update(id as u64, |t| std::mem::replace(&mut t.timer, timer))
            .flatten()
    }

    /// Credit a stored file to token `id`.
    pub fn record(&self, id: u32, user_id: UserId, name: &str, file: &SavedFile) -> Progress {
        let outcome = self.map.update(id as u64, |t| {
            if t.user_id != user_id || t.consumed {
                return Progress::Unknown;
            }
            match &mut t.kind {
                UploadKind::UserPfp => {
                    t.consumed = true;
                    Progress::Pfp(t.clone())
                }
                UploadKind::MsgAttachments(msg) => {
                    let slot = msg.attachments.iter_mut().find(|a| {
                        a.hash.is_none() && a.name == name && a.mime_type == file.mime_type
                    });
                    let Some(slot) = slot else {
                        return Progress::NotExpected;
                    };
                    slot.hash = Some(file.hash.clone());
                    slot.size = Some(file.size as u64);
                    if msg.is_complete() {
                        t.consumed = true;
                        Progress::Complete(t.clone())
                    } else {
                        Progress::Pending {
                            received: msg.received(),
                            total: msg.attachments.len(),
                        }
                    }
                }
            }
        });
        match outcome {
            Some(p @ (Progress::Complete(_) | Progress::Pfp(_))) => {
                self.map.delete(id as u64);
                p
            }
            Some(p) => p,
            None => Progress::Unknown,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for UploadStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn saved(hash: &str, mime: &str) -> SavedFile {
        SavedFile {
            hash: hash.to_string(),
            size: 3,
            mime_type: mime.to_string(),
            written: true,
        }
    }

    fn attachment(name: &str) -> Attachment {
        Attachment {
            name: name.to_string(),
            mime_type: "image/png".to_string(),
            hash: None,
            size: None,
        }
    }

    #[test]
    fn test_attachments_complete_in_any_order() {
        let store = UploadStore::new();
        let msg = PendingMessage {
            group_id: 4,
            content: "look".into(),
            attachments: vec![attachment("a.png"), attachment("b.png")],
        };
        let id = store.create(UserId(7), UploadKind::MsgAttachments(msg));
        assert!(store.is_owned_by(id, UserId(7)));
        assert!(!store.is_owned_by(id, UserId(8)));

        assert_eq!(store.record(id, UserId(8), "b.png", &saved("bb", "image/png")), Progress::Unknown);
        assert_eq!(
            store.record(id, UserId(7), "c.png", &saved("cc", "image/png")),
            Progress::NotExpected
        );
        assert_eq!(
            store.record(id, UserId(7), "b.png", &saved("bb", "image/png")),
            Progress::Pending { received: 1, total: 2 }
        );
        // Same name again: already filled.
        assert_eq!(
            store.record(id, UserId(7), "b.png", &saved("bb", "image/png")),
            Progress::NotExpected
        );
        let Progress::Complete(token) = store.record(id, UserId(7), "a.png", &saved("aa", "image/png")) else {
            panic!("expected completion");
        };
        let UploadKind::MsgAttachments(msg) = token.kind else {
            panic!("wrong kind");
        };
        assert_eq!(msg.attachments[0].hash.as_deref(), Some("aa"));
        assert_eq!(msg.attachments[1].size, Some(3));
        assert!(store.get(id).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_pfp_token_is_single_use() {
        let store = UploadStore::new();
        let id = store.create(UserId(1), UploadKind::UserPfp);
        assert!(matches!(
            store.record(id, UserId(1), "me.png", &saved("ff", "image/png")),
            Progress::Pfp(_)
        ));
        assert_eq!(store.record(id, UserId(1), "me.png", &saved("ff", "image/png")), Progress::Unknown);
        assert!(!store.is_owned_by(id, UserId(1)));
    }
}
