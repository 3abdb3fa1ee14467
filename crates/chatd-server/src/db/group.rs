//! `Groups`, `GroupMembers` and `GroupCodes` submitters.

use chatd_core::UserId;
use chatd_pipeline::{params, DbResult, Payload, Result};

use super::model::{all_rows, Group, GroupCode};
use super::user::user_ids;
use crate::worker::{DbCtx, DbPipeline};

const INSERT_GROUP: &str = "\
    WITH g AS ( \
        INSERT INTO Groups(owner_id, name, \"desc\", public) \
        VALUES ($1::int, $2::varchar(50), $3::varchar(256), $4::boolean) \
        RETURNING * \
    ), m AS ( \
        INSERT INTO GroupMembers(user_id, group_id) SELECT owner_id, group_id FROM g \
    ) \
    SELECT * FROM g;";
const SELECT_GROUP: &str = "SELECT * FROM Groups WHERE group_id = $1::int;";
const SELECT_USER_GROUPS: &str = "\
    SELECT g.* FROM Groups g \
    JOIN GroupMembers m ON m.group_id = g.group_id \
    WHERE m.user_id = $1::int \
    ORDER BY g.group_id;";
const SELECT_PUBLIC_JSON: &str = "\
    SELECT COALESCE(json_agg(json_build_object( \
        'group_id', g.group_id, 'owner_id', g.owner_id, 'name', g.name, \
        'desc', g.\"desc\", 'public', g.public) ORDER BY g.group_id), '[]'::json) \
    FROM Groups g \
    WHERE g.public AND NOT EXISTS ( \
        SELECT 1 FROM GroupMembers m WHERE m.group_id = g.group_id AND m.user_id = $1::int);";
const JOIN_PUBLIC: &str = "\
    INSERT INTO GroupMembers(user_id, group_id) \
    SELECT $1::int, group_id FROM Groups WHERE group_id = $2::int AND public \
    ON CONFLICT DO NOTHING \
    RETURNING group_id;";
const JOIN_CODE: &str = "\
    WITH c AS ( \
        UPDATE GroupCodes SET uses = uses + 1 \
        WHERE invite_code = $2::varchar(8) AND uses < max_uses \
          AND NOT EXISTS (SELECT 1 FROM GroupMembers m \
                          WHERE m.group_id = GroupCodes.group_id AND m.user_id = $1::int) \
        RETURNING group_id \
    ) \
    INSERT INTO GroupMembers(user_id, group_id) SELECT $1::int, group_id FROM c \
    RETURNING group_id;";
const SELECT_MEMBER_IDS: &str = "SELECT user_id FROM GroupMembers WHERE group_id = $1::int ORDER BY user_id;";
const IS_MEMBER: &str = "\
    SELECT EXISTS (SELECT 1 FROM GroupMembers WHERE group_id = $1::int AND user_id = $2::int);";
const INSERT_CODE: &str = "\
    INSERT INTO GroupCodes(group_id, max_uses) \
    SELECT $1::int, $2::int \
    WHERE EXISTS (SELECT 1 FROM GroupMembers WHERE user_id = $3::int AND group_id = $1::int) \
    RETURNING invite_code, uses, max_uses;";
const SELECT_CODES: &str = "\
    SELECT invite_code, uses, max_uses FROM GroupCodes \
    WHERE group_id = $1::int AND EXISTS ( \
        SELECT 1 FROM GroupMembers WHERE group_id = $1::int AND user_id = $2::int) \
    ORDER BY invite_code;";
const DELETE_CODE: &str = "\
    DELETE FROM GroupCodes \
    WHERE invite_code = $1::varchar(8) AND group_id = $2::int AND EXISTS ( \
        SELECT 1 FROM GroupMembers WHERE group_id = $2::int AND user_id = $3::int) \
    RETURNING group_id;";
const SELECT_ATTACHMENT_HASHES: &str = "\
    SELECT a->>'hash' AS hash FROM Messages m \
    CROSS JOIN LATERAL jsonb_array_elements(m.attachments) a \
    WHERE m.group_id = $1::int AND a->>'hash' IS NOT NULL;";
const DELETE_GROUP: &str = "\
    DELETE FROM Groups WHERE group_id = $1::int AND owner_id = $2::int RETURNING group_id;";

fn one_group(res: &DbResult) -> std::result::Result<Payload, String> {
    if res.ntuples() == 0 {
        return Ok(Payload::Empty);
    }
    Group::from_row(res, 0).map(Payload::data)
}

fn groups(res: &DbResult) -> std::result::Result<Payload, String> {
    all_rows(res, Group::from_row).map(Payload::data)
}

/// Decodes to `Payload::Data(Option<u32>)`: the group id of the first row.
fn maybe_group_id(res: &DbResult) -> std::result::Result<Payload, String> {
    Ok(Payload::data(res.parse::<u32>(0, 0)))
}

fn codes(res: &DbResult) -> std::result::Result<Payload, String> {
    all_rows(res, GroupCode::from_row).map(Payload::data)
}

/// Decodes to `Payload::Data(Vec<String>)`.
fn hashes(res: &DbResult) -> std::result::Result<Payload, String> {
    all_rows(res, |r, row| {
        r.value(row, 0)
            .map(str::to_string)
            .ok_or_else(|| "null hash".to_string())
    })
    .map(Payload::data)
}

/// Creates the group with its owner as first member. Decodes to `Data(Group)`.
pub fn create(
    db: &mut DbPipeline,
    ctx: DbCtx,
    owner: UserId,
    name: &str,
    desc: &str,
    public: bool,
) -> Result<()> {
    db.submit_async(INSERT_GROUP, &params![owner.0, name, desc, public], ctx.decode(one_group))
}

/// Decodes to `Data(Group)` or `Empty`.
pub fn get(db: &mut DbPipeline, ctx: DbCtx, group_id: u32) -> Result<()> {
    db.submit_async(SELECT_GROUP, &params![group_id], ctx.decode(one_group))
}

/// Decodes to `Data(Vec<Group>)`.
pub fn user_groups(db: &mut DbPipeline, ctx: DbCtx, user_id: UserId) -> Result<()> {
    db.submit_async(SELECT_USER_GROUPS, &params![user_id.0], ctx.decode(groups))
}

/// Public groups `user_id` is not in, as a JSON array in `Text`.
pub fn public_groups_json(db: &mut DbPipeline, ctx: DbCtx, user_id: UserId) -> Result<()> {
    db.submit_async(
        SELECT_PUBLIC_JSON,
        &params![user_id.0],
        ctx.decode(|res| {
            Ok(Payload::Text(res.value(0, 0).unwrap_or("[]").to_string()))
        }),
    )
}

/// Decodes to `Data(Option<u32>)`, `None` if the group is private,
/// missing or already joined.
pub fn join_public(db: &mut DbPipeline, ctx: DbCtx, user_id: UserId, group_id: u32) -> Result<()> {
    db.submit_async(JOIN_PUBLIC, &params![user_id.0, group_id], ctx.decode(maybe_group_id))
}

/// Spends one use of `code`. Decodes to `Data(Option<u32>)`.
pub fn join_via_code(db: &mut DbPipeline, ctx: DbCtx, user_id: UserId, code: &str) -> Result<()> {
    db.submit_async(JOIN_CODE, &params![user_id.0, code], ctx.decode(maybe_group_id))
}

/// Decodes to `Data(Vec<UserId>)`.
pub fn member_ids(db: &mut DbPipeline, ctx: DbCtx, group_id: u32) -> Result<()> {
    db.submit_async(SELECT_MEMBER_IDS, &params![group_id], ctx.decode(user_ids))
}

/// Decodes to `Data(bool)`.
pub fn is_member(db: &mut DbPipeline, ctx: DbCtx, group_id: u32, user_id: UserId) -> Result<()> {
    db.submit_async(
        IS_MEMBER,
        &params![group_id, user_id.0],
        ctx.decode(|res| Ok(Payload::data(res.value(0, 0) == Some("t")))),
    )
}

/// Inserts a code only if `user_id` is a member. Decodes to
/// `Data(Option<GroupCode>)`.
pub fn insert_code(
    db: &mut DbPipeline,
    ctx: DbCtx,
    group_id: u32,
    max_uses: i32,
    user_id: UserId,
) -> Result<()> {
    db.submit_async(
        INSERT_CODE,
        &params![group_id, max_uses, user_id.0],
        ctx.decode(|res| {
            if res.ntuples() == 0 {
                return Ok(Payload::data(None::<GroupCode>));
            }
            GroupCode::from_row(res, 0).map(|c| Payload::data(Some(c)))
        }),
    )
}

/// Decodes to `Data(Vec<GroupCode>)`; empty for non-members.
pub fn codes_of(db: &mut DbPipeline, ctx: DbCtx, group_id: u32, user_id: UserId) -> Result<()> {
    db.submit_async(SELECT_CODES, &params![group_id, user_id.0], ctx.decode(codes))
}

/// Decodes to `Data(Option<u32>)`.
pub fn delete_code(
    db: &mut DbPipeline,
    ctx: DbCtx,
    code: &str,
    group_id: u32,
    user_id: UserId,
) -> Result<()> {
    db.submit_async(
        DELETE_CODE,
        &params![code, group_id, user_id.0],
        ctx.decode(maybe_group_id),
    )
}

/// Content hashes of every attachment posted in the group.
pub fn attachment_hashes(db: &mut DbPipeline, ctx: DbCtx, group_id: u32) -> Result<()> {
    db.submit_async(SELECT_ATTACHMENT_HASHES, &params![group_id], ctx.decode(hashes))
}

/// Owner-gated; members, messages and codes go with it. Decodes to
/// `Data(Option<u32>)`.
pub fn delete(db: &mut DbPipeline, ctx: DbCtx, group_id: u32, owner: UserId) -> Result<()> {
    db.submit_async(DELETE_GROUP, &params![group_id, owner.0], ctx.decode(maybe_group_id))
}
