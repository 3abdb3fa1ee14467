//! Message commands.

use std::sync::Arc;

use chatd_core::{ClientId, UserId};
use chatd_pipeline::ExecResult;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{broadcast_to_members, db_error, field_str, field_u32, invalid, user_of};
use crate::client::Client;
use crate::db::message as messages;
use crate::db::model::{Attachment, Message};
use crate::files;
use crate::upload::{PendingMessage, UploadKind};
use crate::worker::{DbCtx, DbPipeline, WorkerEnv};

const INSERT_FAILED: &str = "Failed to insert message";

/// Declared attachments, each `{"name", "type"}` with an image type.
fn parse_attachments(req: &Value) -> Result<Vec<Attachment>, std::borrow::Cow<'static, str>> {
    let list = match req.get("attachments") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(list)) => list,
        Some(_) => return Err(invalid("attachments")),
    };
    list.iter()
        .map(|a| {
            let name = field_str(a, "name")?;
            let mime = field_str(a, "type")?;
            if !mime.starts_with("image/") {
                return Err("Attachment type is not image.".into());
            }
            Ok(Attachment {
                name: name.to_string(),
                mime_type: mime.to_string(),
                hash: None,
                size: None,
            })
        })
        .collect()
}

/// Insert `msg` and push it to the group. Attachment files already
/// stored are released again if the insert is refused.
pub(super) fn insert_and_broadcast(
    db: &mut DbPipeline,
    owner: Option<ClientId>,
    user_id: UserId,
    msg: PendingMessage,
) -> ExecResult {
    let hashes: Vec<String> = msg.attachments.iter().filter_map(|a| a.hash.clone()).collect();
    let mut ctx = DbCtx::new("group_msg");
    if let Some(owner) = owner {
        ctx = DbCtx::for_owner("group_msg", owner);
    }
    let ctx = ctx.then(move |_env, db, nodes| {
        let inserted = nodes[0].payload_mut().take_data::<Option<Message>>().flatten();
        let Some(message) = inserted.filter(|_| nodes[0].is_ok()) else {
            for hash in &hashes {
                files::release(db, hash).map_err(db_error)?;
            }
            return Err(INSERT_FAILED.into());
        };
        debug!(msg = message.msg_id, group = message.group_id, "message stored");
        broadcast_to_members(db, message.group_id, message.to_json()).map_err(db_error)
    });
    messages::insert(db, ctx, user_id, msg.group_id, &msg.content, &msg.attachments)
        .map_err(db_error)
}

/// Plain messages go straight in; with attachments the client first gets
/// an upload token and the message waits for its files.
pub(super) fn group_msg(
    env: &mut WorkerEnv,
    db: &mut DbPipeline,
    client: &Arc<Client>,
    req: &Value,
) -> ExecResult {
    let user_id = user_of(client)?;
    let group_id = field_u32(req, "group_id")?;
    let content = field_str(req, "content")?.to_string();
    let attachments = parse_attachments(req)?;

    let msg = PendingMessage {
        group_id,
        content,
        attachments,
    };
    if msg.attachments.is_empty() {
        return insert_and_broadcast(db, Some(client.id()), user_id, msg);
    }

    let count = msg.attachments.len();
    let server = env.server();
    let token = server
        .uploads()
        .create(user_id, UploadKind::MsgAttachments(msg));
    server.start_upload_timer(token);
    info!(user = user_id.0, group = group_id, token, count, "awaiting attachments");
    client
        .send_json(&json!({ "cmd": "send_attachments", "upload_token": token }))
        .ok();
    Ok(())
}

pub(super) fn get_group_msgs(
    _env: &mut WorkerEnv,
    db: &mut DbPipeline,
    client: &Arc<Client>,
    req: &Value,
) -> ExecResult {
    let user_id = user_of(client)?;
    let group_id = field_u32(req, "group_id")?;
    let limit = field_u32(req, "limit")?;
    let offset = field_u32(req, "offset")?;

    let ctx = DbCtx::for_owner("get_group_msgs", client.id()).then(move |env, _db, nodes| {
        let list = nodes[0]
            .payload()
            .text()
            .filter(|_| nodes[0].is_ok())
            .and_then(|t| serde_json::from_str::<Value>(t).ok())
            .ok_or("Failed to get group messages")?;
        if let Some(owner) = nodes[0].owner() {
            env.send(
                owner,
                &json!({ "cmd": "get_group_msgs", "group_id": group_id, "messages": list }),
            );
        }
        Ok(())
    });
    messages::page_json(db, ctx, group_id, limit, offset, user_id).map_err(db_error)
}

/// Author only. The group hears about it and the attachments lose a
/// reference each.
pub(super) fn delete_msg(
    _env: &mut WorkerEnv,
    db: &mut DbPipeline,
    client: &Arc<Client>,
    req: &Value,
) -> ExecResult {
    let user_id = user_of(client)?;
    let msg_id = field_u32(req, "msg_id")?;

    let ctx = DbCtx::for_owner("delete_msg", client.id()).then(move |_env, db, nodes| {
        if nodes[0].error().is_some() {
            return Err("Failed to delete message".into());
        }
        let Some(message) = nodes[0].payload_mut().take_data::<Option<Message>>().flatten() else {
            return Err("Permission denied".into());
        };
        info!(msg = message.msg_id, group = message.group_id, "message deleted");
        broadcast_to_members(
            db,
            message.group_id,
            json!({ "cmd": "delete_msg", "group_id": message.group_id, "msg_id": message.msg_id }),
        )
        .map_err(db_error)?;
        for hash in message.attachments.iter().filter_map(|a| a.hash.as_deref()) {
            files::release(db, hash).map_err(db_error)?;
        }
        Ok(())
    });
    messages::delete(db, ctx, msg_id, user_id).map_err(db_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::recv_frames;
    use crate::handler::tests::Harness;
    use chatd_pipeline::DbResult;

    fn message_row(msg_id: u32, user_id: u32, attachments: &str) -> DbResult {
        DbResult::tuples(
            ["msg_id", "group_id", "user_id", "content", "attachments", "timestamp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            vec![vec![
                Some(msg_id.to_string()),
                Some("2".into()),
                Some(user_id.to_string()),
                Some("hi".into()),
                Some(attachments.into()),
                Some("now".into()),
            ]],
        )
    }

    #[test]
    fn test_plain_message_is_broadcast() {
        let mut h = Harness::new();
        let (client, mut peer) = h.login(7);
        let (_other, mut other_peer) = h.login(8);
        h.run(&client, json!({"cmd": "group_msg", "group_id": 2, "content": "hi"}));
        assert_eq!(h.script.sent_count(), 1);

        h.answer([message_row(10, 7, "[]")]);
        // the member lookup is queued behind the insert
        assert_eq!(h.script.sent_count(), 2);
        h.answer([DbResult::single_column("user_id", &["7", "8"])]);

        for got in [recv_frames(&mut peer), recv_frames(&mut other_peer)] {
            assert_eq!(got.len(), 1);
            assert_eq!(got[0]["cmd"], "group_msg");
            assert_eq!(got[0]["msg_id"], 10);
            assert_eq!(got[0]["content"], "hi");
        }
    }

    #[test]
    fn test_message_with_attachments_waits_for_upload() {
        let mut h = Harness::new();
        let (client, mut peer) = h.login(7);
        h.run(
            &client,
            json!({"cmd": "group_msg", "group_id": 2, "content": "look",
                   "attachments": [{"name": "a.png", "type": "image/png"}]}),
        );
        assert_eq!(h.script.sent_count(), 0);
        let got = recv_frames(&mut peer);
        assert_eq!(got[0]["cmd"], "send_attachments");
        let token = got[0]["upload_token"].as_u64().unwrap() as u32;
        assert!(h.server.uploads().is_owned_by(token, UserId(7)));
    }

    #[test]
    fn test_non_image_attachment_refused() {
        let mut h = Harness::new();
        let (client, mut peer) = h.login(7);
        h.run(
            &client,
            json!({"cmd": "group_msg", "group_id": 2, "content": "x",
                   "attachments": [{"name": "a.zip", "type": "application/zip"}]}),
        );
        let got = recv_frames(&mut peer);
        assert_eq!(got[0]["error_msg"], "Attachment type is not image.");
        assert!(h.server.uploads().is_empty());
    }

    #[test]
    fn test_delete_message_of_someone_else() {
        let mut h = Harness::new();
        let (client, mut peer) = h.login(7);
        h.run(&client, json!({"cmd": "delete_msg", "msg_id": 10}));
        h.answer([DbResult::tuples(
            ["msg_id", "group_id", "user_id", "content", "attachments", "timestamp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            vec![],
        )]);
        let got = recv_frames(&mut peer);
        assert_eq!(got[0]["error_msg"], "Permission denied");
        assert_eq!(h.script.sent_count(), 1);
    }

    #[test]
    fn test_delete_message_releases_attachments() {
        let mut h = Harness::new();
        let (client, _peer) = h.login(7);
        h.run(&client, json!({"cmd": "delete_msg", "msg_id": 10}));
        h.answer([message_row(
            10,
            7,
            r#"[{"name":"a.png","type":"image/png","hash":"aa","size":3}]"#,
        )]);
        let sql = h.script.sent_sql();
        assert_eq!(sql.len(), 3);
        assert!(sql[1].contains("GroupMembers"));
        assert!(sql[2].contains("ref_count - 1"));
    }
}
