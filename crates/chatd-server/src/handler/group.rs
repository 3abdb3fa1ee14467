//! Group commands.

use std::sync::Arc;

use chatd_core::{ClientId, UserId};
use chatd_pipeline::ExecResult;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{
    broadcast_to_members, db_error, field_bool, field_i32, field_str, field_u32, opt_str,
    user_of,
};
use crate::client::Client;
use crate::db::group as groups;
use crate::db::model::{Group, GroupCode};
use crate::files;
use crate::worker::{DbCtx, DbPipeline, WorkerEnv};

const NOT_MEMBER: &str = "Not a group member";

fn groups_frame(groups: &[Group]) -> Value {
    json!({ "cmd": "client_groups", "groups": groups })
}

fn codes_frame(group_id: u32, codes: &[GroupCode]) -> Value {
    json!({ "cmd": "group_codes", "group_id": group_id, "codes": codes })
}

pub(super) fn group_create(
    _env: &mut WorkerEnv,
    db: &mut DbPipeline,
    client: &Arc<Client>,
    req: &Value,
) -> ExecResult {
    let owner = user_of(client)?;
    let name = field_str(req, "name")?;
    let public = field_bool(req, "public")?;
    let desc = opt_str(req, "desc")?.unwrap_or_default();

    let ctx = DbCtx::for_owner("group_create", client.id()).then(|env, _db, nodes| {
        let group = match nodes[0].payload_mut().take_data::<Group>() {
            Some(group) if nodes[0].is_ok() => group,
            _ => return Err("Failed to create group".into()),
        };
        info!(group = group.group_id, owner = group.owner_id, "group created");
        if let Some(owner) = nodes[0].owner() {
            env.send(owner, &groups_frame(&[group]));
        }
        Ok(())
    });
    groups::create(db, ctx, owner, name, desc, public).map_err(db_error)
}

pub(super) fn client_groups(
    _env: &mut WorkerEnv,
    db: &mut DbPipeline,
    client: &Arc<Client>,
    _req: &Value,
) -> ExecResult {
    let user_id = user_of(client)?;
    let ctx = DbCtx::for_owner("client_groups", client.id()).then(|env, _db, nodes| {
        if nodes[0].error().is_some() {
            return Err("Failed to get groups".into());
        }
        let list = nodes[0]
            .payload_mut()
            .take_data::<Vec<Group>>()
            .unwrap_or_default();
        if let Some(owner) = nodes[0].owner() {
            env.send(owner, &groups_frame(&list));
        }
        Ok(())
    });
    groups::user_groups(db, ctx, user_id).map_err(db_error)
}

/// Public groups the caller has not joined.
pub(super) fn get_all_groups(
    _env: &mut WorkerEnv,
    db: &mut DbPipeline,
    client: &Arc<Client>,
    _req: &Value,
) -> ExecResult {
    let user_id = user_of(client)?;
    let ctx = DbCtx::for_owner("get_all_groups", client.id()).then(|env, _db, nodes| {
        let list = nodes[0]
            .payload()
            .text()
            .filter(|_| nodes[0].is_ok())
            .and_then(|t| serde_json::from_str::<Value>(t).ok())
            .ok_or("Failed to get public groups")?;
        if let Some(owner) = nodes[0].owner() {
            env.send(owner, &json!({ "cmd": "get_all_groups", "groups": list }));
        }
        Ok(())
    });
    groups::public_groups_json(db, ctx, user_id).map_err(db_error)
}

/// Tell the joiner its new group and the members about the joiner.
fn on_joined(
    db: &mut DbPipeline,
    owner: Option<ClientId>,
    label: &'static str,
    user_id: UserId,
    group_id: u32,
) -> ExecResult {
    info!(user = user_id.0, group = group_id, "joined group");
    let mut ctx = DbCtx::new(label);
    if let Some(owner) = owner {
        ctx = DbCtx::for_owner(label, owner);
    }
    let ctx = ctx.then(|env, _db, nodes| {
        let group = nodes[0].payload_mut().take_data::<Group>();
        match (group, nodes[0].owner()) {
            (Some(group), Some(owner)) => {
                env.send(owner, &groups_frame(&[group]));
            }
            _ => debug!("joined group vanished before it could be sent"),
        }
        Ok(())
    });
    groups::get(db, ctx, group_id).map_err(db_error)?;
    broadcast_to_members(
        db,
        group_id,
        json!({ "cmd": "join_group", "user_id": user_id.0, "group_id": group_id }),
    )
    .map_err(db_error)
}

pub(super) fn join_group(
    _env: &mut WorkerEnv,
    db: &mut DbPipeline,
    client: &Arc<Client>,
    req: &Value,
) -> ExecResult {
    let user_id = user_of(client)?;
    let group_id = field_u32(req, "group_id")?;
    let ctx = DbCtx::for_owner("join_group", client.id()).then(move |_env, db, nodes| {
        match nodes[0].payload_mut().take_data::<Option<u32>>().flatten() {
            Some(gid) if nodes[0].is_ok() => {
                on_joined(db, nodes[0].owner(), "join_group", user_id, gid)
            }
            _ => Err("Failed to join group".into()),
        }
    });
    groups::join_public(db, ctx, user_id, group_id).map_err(db_error)
}

pub(super) fn join_group_code(
    _env: &mut WorkerEnv,
    db: &mut DbPipeline,
    client: &Arc<Client>,
    req: &Value,
) -> ExecResult {
    let user_id = user_of(client)?;
    let code = field_str(req, "code")?;
    let ctx = DbCtx::for_owner("join_group_code", client.id()).then(move |_env, db, nodes| {
        match nodes[0].payload_mut().take_data::<Option<u32>>().flatten() {
            Some(gid) if nodes[0].is_ok() => {
                on_joined(db, nodes[0].owner(), "join_group_code", user_id, gid)
            }
            _ => Err("Failed to join or already joined".into()),
        }
    });
    groups::join_via_code(db, ctx, user_id, code).map_err(db_error)
}

pub(super) fn create_group_code(
    _env: &mut WorkerEnv,
    db: &mut DbPipeline,
    client: &Arc<Client>,
    req: &Value,
) -> ExecResult {
    let user_id = user_of(client)?;
    let group_id = field_u32(req, "group_id")?;
    let max_uses = match field_i32(req, "max_uses")? {
        0 => 1,
        n => n,
    };
    let ctx = DbCtx::for_owner("create_group_code", client.id()).then(move |env, _db, nodes| {
        if nodes[0].error().is_some() {
            return Err("Failed to create group code".into());
        }
        let Some(code) = nodes[0].payload_mut().take_data::<Option<GroupCode>>().flatten() else {
            return Err(NOT_MEMBER.into());
        };
        if let Some(owner) = nodes[0].owner() {
            env.send(owner, &codes_frame(group_id, &[code]));
        }
        Ok(())
    });
    groups::insert_code(db, ctx, group_id, max_uses, user_id).map_err(db_error)
}

/// Two statements: membership, then the codes.
pub(super) fn get_group_codes(
    _env: &mut WorkerEnv,
    db: &mut DbPipeline,
    client: &Arc<Client>,
    req: &Value,
) -> ExecResult {
    let user_id = user_of(client)?;
    let group_id = field_u32(req, "group_id")?;
    let owner = client.id();
    let head = DbCtx::for_owner("get_group_codes", owner).then(move |env, _db, nodes| {
        let [member, list, ..] = nodes else {
            return Err(NOT_MEMBER.into());
        };
        if member.payload_mut().take_data::<bool>() != Some(true) {
            return Err(NOT_MEMBER.into());
        }
        let codes = list
            .payload_mut()
            .take_data::<Vec<GroupCode>>()
            .unwrap_or_default();
        env.send(owner, &codes_frame(group_id, &codes));
        Ok(())
    });
    groups::is_member(db, head, group_id, user_id).map_err(db_error)?;
    groups::codes_of(db, DbCtx::for_owner("get_group_codes", owner), group_id, user_id)
        .map_err(db_error)
}

pub(super) fn delete_group_code(
    _env: &mut WorkerEnv,
    db: &mut DbPipeline,
    client: &Arc<Client>,
    req: &Value,
) -> ExecResult {
    let user_id = user_of(client)?;
    let code = field_str(req, "code")?;
    let group_id = field_u32(req, "group_id")?;
    let owner = client.id();
    let head = DbCtx::for_owner("delete_group_code", owner).then(move |_env, _db, nodes| {
        let [member, deleted, ..] = nodes else {
            return Err("Failed to delete group code".into());
        };
        if member.payload_mut().take_data::<bool>() != Some(true) {
            return Err("Not a group owner".into());
        }
        match deleted.payload_mut().take_data::<Option<u32>>().flatten() {
            Some(_) => Ok(()),
            None => Err("Failed to delete group code".into()),
        }
    });
    groups::is_member(db, head, group_id, user_id).map_err(db_error)?;
    groups::delete_code(db, DbCtx::for_owner("delete_group_code", owner), code, group_id, user_id)
        .map_err(db_error)
}

/// Owner only. Members are told, then the group's files are released.
pub(super) fn delete_group(
    _env: &mut WorkerEnv,
    db: &mut DbPipeline,
    client: &Arc<Client>,
    req: &Value,
) -> ExecResult {
    let user_id = user_of(client)?;
    let group_id = field_u32(req, "group_id")?;
    let owner = client.id();
    let head = DbCtx::for_owner("delete_group", owner).then(move |env, db, nodes| {
        let [members, hashes, deleted, ..] = nodes else {
            return Err("Failed to delete group".into());
        };
        if let Some(e) = deleted.error() {
            debug!(group = group_id, error = e, "group delete failed");
            return Err("Failed to delete group".into());
        }
        if deleted.payload_mut().take_data::<Option<u32>>().flatten().is_none() {
            return Err("Permission denied".into());
        }
        info!(group = group_id, "group deleted");

        let frame = json!({ "cmd": "delete_group", "group_id": group_id });
        let clients = env.server().clients();
        for id in members
            .payload_mut()
            .take_data::<Vec<UserId>>()
            .unwrap_or_default()
        {
            clients.send_to_user(id, &frame);
        }
        for hash in hashes
            .payload_mut()
            .take_data::<Vec<String>>()
            .unwrap_or_default()
        {
            files::release(db, &hash).map_err(db_error)?;
        }
        Ok(())
    });
    groups::member_ids(db, head, group_id).map_err(db_error)?;
    groups::attachment_hashes(db, DbCtx::for_owner("delete_group", owner), group_id)
        .map_err(db_error)?;
    groups::delete(db, DbCtx::for_owner("delete_group", owner), group_id, user_id).map_err(db_error)
}

pub(super) fn get_member_ids(
    _env: &mut WorkerEnv,
    db: &mut DbPipeline,
    client: &Arc<Client>,
    req: &Value,
) -> ExecResult {
    let user_id = user_of(client)?;
    let group_id = field_u32(req, "group_id")?;
    let owner = client.id();
    let head = DbCtx::for_owner("get_member_ids", owner).then(move |env, _db, nodes| {
        let [member, ids, ..] = nodes else {
            return Err(NOT_MEMBER.into());
        };
        if member.payload_mut().take_data::<bool>() != Some(true) {
            return Err(NOT_MEMBER.into());
        }
        if ids.error().is_some() {
            return Err("Failed to get group member IDs".into());
        }
        let ids: Vec<u32> = ids
            .payload_mut()
            .take_data::<Vec<UserId>>()
            .unwrap_or_default()
            .into_iter()
            .map(|u| u.0)
            .collect();
        env.send(
            owner,
            &json!({ "cmd": "get_member_ids", "group_id": group_id, "member_ids": ids }),
        );
        Ok(())
    });
    groups::is_member(db, head, group_id, user_id).map_err(db_error)?;
    groups::member_ids(db, DbCtx::for_owner("get_member_ids", owner), group_id).map_err(db_error)
}
