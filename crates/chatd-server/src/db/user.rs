//! `Users` submitters.

use chatd_core::UserId;
use chatd_pipeline::{params, Param, Payload, Result};

use super::model::{all_rows, User};
use crate::worker::{DbCtx, DbPipeline};

const SELECT_BY_ID: &str = "SELECT * FROM Users WHERE user_id = $1::int;";
const SELECT_BY_NAME: &str = "SELECT * FROM Users WHERE username = $1::varchar(50);";
const SELECT_MANY: &str = "SELECT * FROM Users WHERE user_id = ANY($1::int[]) ORDER BY user_id;";
const INSERT: &str = "\
    INSERT INTO Users(username, displayname, hash, salt) \
    VALUES ($1::varchar(50), $2::varchar(50), $3::bytea, $4::bytea) \
    RETURNING *;";
const UPDATE: &str = "\
    UPDATE Users SET \
        username = COALESCE($2::varchar(50), username), \
        displayname = COALESCE($3::varchar(50), displayname) \
    WHERE user_id = $1::int \
    RETURNING *;";
const UPDATE_PFP: &str = "\
    UPDATE Users u SET pfp_hash = $2::varchar(64) \
    FROM (SELECT user_id, pfp_hash AS old_hash FROM Users WHERE user_id = $1::int FOR UPDATE) o \
    WHERE u.user_id = o.user_id \
    RETURNING o.old_hash;";
const SELECT_CONNECTED: &str = "\
    SELECT DISTINCT b.user_id FROM GroupMembers a \
    JOIN GroupMembers b ON a.group_id = b.group_id \
    WHERE a.user_id = $1::int AND b.user_id <> $1::int;";

/// Decodes to `Payload::Data(User)`, or `Empty` when no row matched.
fn one_user(res: &chatd_pipeline::DbResult) -> std::result::Result<Payload, String> {
    if res.ntuples() == 0 {
        return Ok(Payload::Empty);
    }
    User::from_row(res, 0).map(Payload::data)
}

/// Decodes to `Payload::Data(Vec<UserId>)`.
pub(crate) fn user_ids(res: &chatd_pipeline::DbResult) -> std::result::Result<Payload, String> {
    all_rows(res, |r, row| {
        r.parse::<u32>(row, 0)
            .map(UserId)
            .ok_or_else(|| "user_id is not a number".to_string())
    })
    .map(Payload::data)
}

pub fn get_by_id(db: &mut DbPipeline, ctx: DbCtx, user_id: UserId) -> Result<()> {
    db.submit_async(SELECT_BY_ID, &params![user_id.0], ctx.decode(one_user))
}

pub fn get_by_name(db: &mut DbPipeline, ctx: DbCtx, username: &str) -> Result<()> {
    db.submit_async(SELECT_BY_NAME, &params![username], ctx.decode(one_user))
}

/// Decodes to `Payload::Data(Vec<User>)`.
pub fn get_many(db: &mut DbPipeline, ctx: DbCtx, ids: &[UserId]) -> Result<()> {
    db.submit_async(
        SELECT_MANY,
        &params![int_array(ids.iter().map(|u| u.0))],
        ctx.decode(|res| all_rows(res, User::from_row).map(Payload::data)),
    )
}

pub fn insert(
    db: &mut DbPipeline,
    ctx: DbCtx,
    username: &str,
    displayname: &str,
    hash: &[u8],
    salt: &[u8],
) -> Result<()> {
    db.submit_async(
        INSERT,
        &params![username, displayname, hash.to_vec(), salt.to_vec()],
        ctx.decode(one_user),
    )
}

/// `None` fields keep their current value.
pub fn update(
    db: &mut DbPipeline,
    ctx: DbCtx,
    user_id: UserId,
    username: Option<&str>,
    displayname: Option<&str>,
) -> Result<()> {
    db.submit_async(
        UPDATE,
        &params![user_id.0, username, displayname],
        ctx.decode(one_user),
    )
}

/// Decodes to `Payload::Text(old_hash)`, `Empty` if there was none.
pub fn update_pfp(db: &mut DbPipeline, ctx: DbCtx, user_id: UserId, hash: &str) -> Result<()> {
    db.submit_async(
        UPDATE_PFP,
        &params![user_id.0, hash],
        ctx.decode(|res| {
            Ok(res
                .value(0, 0)
                .map(|s| Payload::Text(s.to_string()))
                .unwrap_or_default())
        }),
    )
}

/// Users sharing at least one group with `user_id`.
pub fn get_connected(db: &mut DbPipeline, ctx: DbCtx, user_id: UserId) -> Result<()> {
    db.submit_async(SELECT_CONNECTED, &params![user_id.0], ctx.decode(user_ids))
}

/// PostgreSQL array literal, e.g. `{1,2,3}`.
pub(crate) fn int_array(ids: impl Iterator<Item = u32>) -> Param {
    let body: Vec<String> = ids.map(|i| i.to_string()).collect();
    Param::Text(format!("{{{}}}", body.join(",")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_array_literal() {
        assert_eq!(int_array([1u32, 20, 3].into_iter()), Param::Text("{1,20,3}".into()));
        assert_eq!(int_array(std::iter::empty()), Param::Text("{}".into()));
    }
}
