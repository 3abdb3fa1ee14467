//! `upload`: file bytes against an upload token.
//!
//! ```text
//!   upload ──► [save chain] ──► record on token
//!                                  ├─ pending   : wait for the rest
//!                                  ├─ complete  : insert message, broadcast
//!                                  └─ pfp       : swap pfp_hash, release old, rtusm
//! ```

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chatd_core::{ClientId, UserId};
use chatd_pipeline::ExecResult;
use serde_json::Value;
use tracing::{debug, info, trace};

use super::{db_error, field_str, field_u32, invalid, message, owner_client, user_of};
use crate::client::Client;
use crate::db::user as users;
use crate::files::{self, SavedFile};
use crate::status::{self, StatusUpdate};
use crate::upload::{Progress, UploadKind};
use crate::worker::{DbCtx, DbPipeline, WorkerEnv};

const BAD_TOKEN: &str = "Invalid upload token";

pub(super) fn upload(
    env: &mut WorkerEnv,
    db: &mut DbPipeline,
    client: &Arc<Client>,
    req: &Value,
) -> ExecResult {
    let user_id = user_of(client)?;
    let token = field_u32(req, "upload_token")?;
    let name = field_str(req, "name")?.to_string();
    let mime = field_str(req, "type")?.to_string();
    let data = field_str(req, "data")?;

    let Some(kind) = env
        .server()
        .uploads()
        .get(token)
        .filter(|t| t.user_id == user_id && !t.consumed)
        .map(|t| t.kind)
    else {
        return Err(BAD_TOKEN.into());
    };
    if matches!(kind, UploadKind::UserPfp) && !mime.starts_with("image/") {
        return Err("Profile picture must be an image".into());
    }
    let bytes = BASE64.decode(data).map_err(|_| invalid("data"))?;
    trace!(token, %name, size = bytes.len(), "upload received");

    let owner = client.id();
    files::save(db, Some(owner), "upload", mime, bytes, move |env, db, saved| {
        stored(env, db, owner, user_id, token, &name, saved)
    })
    .map_err(db_error)
}

/// The file is on disk and counted; credit it to its token.
fn stored(
    env: &mut WorkerEnv,
    db: &mut DbPipeline,
    owner: ClientId,
    user_id: UserId,
    token: u32,
    name: &str,
    saved: SavedFile,
) -> ExecResult {
    let server = Arc::clone(env.server());
    match server.uploads().record(token, user_id, name, &saved) {
        Progress::Unknown => {
            files::release(db, &saved.hash).map_err(db_error)?;
            Err(BAD_TOKEN.into())
        }
        Progress::NotExpected => {
            files::release(db, &saved.hash).map_err(db_error)?;
            Err("Unexpected attachment".into())
        }
        Progress::Pending { received, total } => {
            debug!(token, received, total, "attachment stored");
            Ok(())
        }
        Progress::Complete(done) => {
            server.stop_upload_timer(token, done.timer);
            let UploadKind::MsgAttachments(msg) = done.kind else {
                return Err(BAD_TOKEN.into());
            };
            info!(token, group = msg.group_id, files = msg.attachments.len(), "attachments complete");
            message::insert_and_broadcast(db, Some(owner), user_id, msg)
        }
        Progress::Pfp(done) => {
            server.stop_upload_timer(token, done.timer);
            set_pfp(db, owner, user_id, saved.hash)
        }
    }
}

/// Point the user at the new picture and drop a reference to the old one.
fn set_pfp(db: &mut DbPipeline, owner: ClientId, user_id: UserId, hash: String) -> ExecResult {
    let new_hash = hash.clone();
    let ctx = DbCtx::for_owner("upload", owner).then(move |env, db, nodes| {
        if let Some(e) = nodes[0].error() {
            debug!(user = user_id.0, error = e, "pfp update failed");
            files::release(db, &new_hash).map_err(db_error)?;
            return Err("Failed to update user".into());
        }
        if let Some(old) = nodes[0].payload().text() {
            files::release(db, old).map_err(db_error)?;
        }
        if let Some(client) = owner_client(env, owner) {
            client.update_user(|u| u.pfp_hash = Some(new_hash.clone()));
        }
        info!(user = user_id.0, hash = %new_hash, "profile picture changed");

        let update = StatusUpdate::pfp(user_id, new_hash);
        env.send(owner, &update.to_json());
        status::broadcast(db, update).map_err(db_error)
    });
    users::update_pfp(db, ctx, user_id, &hash).map_err(db_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::recv_frames;
    use crate::handler::tests::Harness;
    use crate::upload::PendingMessage;
    use chatd_pipeline::DbResult;
    use serde_json::json;

    const PNG: &[u8] = b"\x89PNG not really";

    fn upload_req(token: u32, name: &str) -> Value {
        json!({
            "cmd": "upload",
            "upload_token": token,
            "name": name,
            "type": "image/png",
            "data": BASE64.encode(PNG),
        })
    }

    #[test]
    fn test_first_copy_is_written() {
        let mut h = Harness::new();
        let (client, mut peer) = h.login(3);
        let token = h.server.uploads().create(UserId(3), UploadKind::UserPfp);
        h.run(&client, upload_req(token, "me.png"));
        assert_eq!(h.script.sent_count(), 2);

        h.answer([
            DbResult::single_column("ref_count", &["1"]),
            DbResult::single_column("ref_count", &["1"]),
        ]);
        let hash = files::sha256_hex(PNG);
        let path = h.server.files().path_for("image/png", &hash);
        assert_eq!(std::fs::read(&path).unwrap(), PNG);
        assert!(h.server.uploads().get(token).is_none());
        assert!(h.script.sent_sql()[2].contains("pfp_hash"));

        // no previous picture
        h.answer([DbResult::tuples(vec!["old_hash".into()], vec![vec![None]])]);
        let got = recv_frames(&mut peer);
        assert_eq!(got, vec![json!({"cmd": "rtusm", "user_id": 3, "pfp_name": hash})]);
        assert_eq!(
            client.user().unwrap().pfp_hash.as_deref(),
            Some(files::sha256_hex(PNG).as_str())
        );
    }

    #[test]
    fn test_duplicate_is_not_rewritten() {
        let mut h = Harness::new();
        let (client, _peer) = h.login(3);
        let msg = PendingMessage {
            group_id: 2,
            content: "pics".into(),
            attachments: vec![
                crate::db::model::Attachment {
                    name: "a.png".into(),
                    mime_type: "image/png".into(),
                    hash: None,
                    size: None,
                },
                crate::db::model::Attachment {
                    name: "b.png".into(),
                    mime_type: "image/png".into(),
                    hash: None,
                    size: None,
                },
            ],
        };
        let token = h.server.uploads().create(UserId(3), UploadKind::MsgAttachments(msg));
        h.run(&client, upload_req(token, "a.png"));
        h.answer([
            DbResult::single_column("ref_count", &["2"]),
            DbResult::single_column("ref_count", &["2"]),
        ]);
        let path = h.server.files().path_for("image/png", &files::sha256_hex(PNG));
        assert!(!path.exists());
        // one of two in
        assert!(h.server.uploads().get(token).is_some());
        assert_eq!(h.script.sent_count(), 2);
    }

    #[test]
    fn test_first_copy_written_despite_concurrent_bump() {
        let mut h = Harness::new();
        let (client, _peer) = h.login(3);
        let token = h.server.uploads().create(UserId(3), UploadKind::UserPfp);
        h.run(&client, upload_req(token, "me.png"));
        assert!(h.script.sent_sql()[0].contains("RETURNING ref_count"));

        // Another worker's insert of the same bytes landed between our two
        // statements.
        h.answer([
            DbResult::single_column("ref_count", &["1"]),
            DbResult::single_column("ref_count", &["2"]),
        ]);
        let path = h.server.files().path_for("image/png", &files::sha256_hex(PNG));
        assert_eq!(std::fs::read(&path).unwrap(), PNG);
        assert!(h.server.uploads().get(token).is_none());
    }

    #[test]
    fn test_save_failure_reaches_owner() {
        let mut h = Harness::new();
        let (client, mut peer) = h.login(3);
        let token = h.server.uploads().create(UserId(3), UploadKind::UserPfp);
        h.run(&client, upload_req(token, "me.png"));
        h.answer([
            DbResult::error("disk full"),
            DbResult::single_column("ref_count", &["1"]),
        ]);
        let got = recv_frames(&mut peer);
        assert_eq!(got[0]["from"], "upload");
        assert_eq!(got[0]["error_msg"], "Failed to save file");
        // the token survives for a retry
        assert!(h.server.uploads().is_owned_by(token, UserId(3)));
    }

    #[test]
    fn test_owner_gone_before_results() {
        let mut h = Harness::new();
        let (client, _peer) = h.login(3);
        let token = h.server.uploads().create(UserId(3), UploadKind::UserPfp);
        h.run(&client, upload_req(token, "me.png"));
        h.server.clients().remove(client.id());
        drop(client);

        h.answer([
            DbResult::single_column("ref_count", &["1"]),
            DbResult::single_column("ref_count", &["1"]),
        ]);
        h.answer([DbResult::tuples(vec!["old_hash".into()], vec![vec![None]])]);
        assert_eq!(h.db.stats().results, 3);
    }

    #[test]
    fn test_foreign_token_refused() {
        let mut h = Harness::new();
        let (client, mut peer) = h.login(3);
        let token = h.server.uploads().create(UserId(4), UploadKind::UserPfp);
        h.run(&client, upload_req(token, "me.png"));
        let got = recv_frames(&mut peer);
        assert_eq!(got[0]["error_msg"], BAD_TOKEN);
        assert_eq!(h.script.sent_count(), 0);
    }
}
