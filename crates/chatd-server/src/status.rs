//! Real-time user status messages (`rtusm`).
//!
//! A change is pushed to every online user who shares a group with the
//! subject. Recipients come from the database, reachability from the
//! client registry at delivery time.

use std::fmt;

use chatd_core::UserId;
use serde_json::{json, Value};
use tracing::trace;

use crate::worker::{DbCtx, DbPipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Offline,
    Online,
    Away,
    Dnd,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Offline => "offline",
            Status::Online => "online",
            Status::Away => "away",
            Status::Dnd => "dnd",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which fields of a user changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub user_id: UserId,
    pub status: Option<Status>,
    pub pfp_name: Option<String>,
}

impl StatusUpdate {
    pub fn status(user_id: UserId, status: Status) -> Self {
        Self {
            user_id,
            status: Some(status),
            pfp_name: None,
        }
    }

    pub fn pfp(user_id: UserId, pfp_name: impl Into<String>) -> Self {
        Self {
            user_id,
            status: None,
            pfp_name: Some(pfp_name.into()),
        }
    }

    pub fn to_json(&self) -> Value {
        let mut v = json!({ "cmd": "rtusm", "user_id": self.user_id.0 });
        if let Some(status) = self.status {
            v["status"] = json!(status.as_str());
        }
        if let Some(pfp) = &self.pfp_name {
            v["pfp_name"] = json!(pfp);
        }
        v
    }
}

/// Queue the broadcast. It has no owner: nobody hears about a failure.
pub fn broadcast(db: &mut DbPipeline, update: StatusUpdate) -> chatd_pipeline::Result<()> {
    let subject = update.user_id;
    let ctx = DbCtx::new("rtusm").then(move |env, _db, nodes| {
        let ids = nodes[0]
            .payload_mut()
            .take_data::<Vec<UserId>>()
            .unwrap_or_default();
        let frame = update.to_json();
        let clients = env.server().clients();
        let sent = ids
            .into_iter()
            .filter(|&id| clients.send_to_user(id, &frame))
            .count();
        trace!(user = subject.0, sent, "status broadcast");
        Ok(())
    });
    crate::db::user::get_connected(db, ctx, subject)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_json() {
        let v = StatusUpdate::status(UserId(3), Status::Online).to_json();
        assert_eq!(v, json!({"cmd": "rtusm", "user_id": 3, "status": "online"}));
        let v = StatusUpdate::pfp(UserId(3), "abc").to_json();
        assert_eq!(v, json!({"cmd": "rtusm", "user_id": 3, "pfp_name": "abc"}));
    }
}
