//! `Messages` submitters.

use chatd_core::UserId;
use chatd_pipeline::{params, DbResult, Payload, Result};

use super::model::{Attachment, Message};
use crate::worker::{DbCtx, DbPipeline};

const INSERT: &str = "\
    INSERT INTO Messages(user_id, group_id, content, attachments) \
    SELECT $1::int, $2::int, $3::text, $4::jsonb \
    WHERE EXISTS (SELECT 1 FROM GroupMembers WHERE user_id = $1::int AND group_id = $2::int) \
    RETURNING *;";
const SELECT_PAGE_JSON: &str = "\
    SELECT COALESCE(json_agg(t ORDER BY t.msg_id DESC), '[]'::json) FROM ( \
        SELECT msg_id, group_id, user_id, content, attachments, timestamp FROM Messages \
        WHERE group_id = $1::int AND EXISTS ( \
            SELECT 1 FROM GroupMembers WHERE group_id = $1::int AND user_id = $4::int) \
        ORDER BY msg_id DESC LIMIT $2::int OFFSET $3::int \
    ) t;";
const DELETE: &str = "\
    DELETE FROM Messages WHERE msg_id = $1::int AND user_id = $2::int RETURNING *;";

/// Decodes to `Data(Option<Message>)`.
fn maybe_message(res: &DbResult) -> std::result::Result<Payload, String> {
    if res.ntuples() == 0 {
        return Ok(Payload::data(None::<Message>));
    }
    Message::from_row(res, 0).map(|m| Payload::data(Some(m)))
}

/// Member-gated insert. Decodes to `Data(Option<Message>)`.
pub fn insert(
    db: &mut DbPipeline,
    ctx: DbCtx,
    user_id: UserId,
    group_id: u32,
    content: &str,
    attachments: &[Attachment],
) -> Result<()> {
    let attachments = serde_json::to_string(attachments).unwrap_or_else(|_| "[]".to_string());
    db.submit_async(
        INSERT,
        &params![user_id.0, group_id, content, attachments],
        ctx.decode(maybe_message),
    )
}

/// One page, newest first, as a JSON array in `Text`.
pub fn page_json(
    db: &mut DbPipeline,
    ctx: DbCtx,
    group_id: u32,
    limit: u32,
    offset: u32,
    reader: UserId,
) -> Result<()> {
    db.submit_async(
        SELECT_PAGE_JSON,
        &params![group_id, limit, offset, reader.0],
        ctx.decode(|res| Ok(Payload::Text(res.value(0, 0).unwrap_or("[]").to_string()))),
    )
}

/// Deletes only if `user_id` wrote the message. Decodes to
/// `Data(Option<Message>)` with the deleted row.
pub fn delete(db: &mut DbPipeline, ctx: DbCtx, msg_id: u32, user_id: UserId) -> Result<()> {
    db.submit_async(DELETE, &params![msg_id, user_id.0], ctx.decode(maybe_message))
}
