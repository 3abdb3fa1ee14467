//! Account commands: register, login, session resume, profile.

use std::sync::Arc;

use chatd_core::{ClientId, UserId};
use chatd_pipeline::ExecResult;
use rand::RngCore;
use serde_json::{json, Value};
use sha2::{Digest, Sha512};
use tracing::{debug, info};

use super::{
    db_error, field_array, field_bool, field_str, field_u32, opt_bool, opt_str, owner_client,
    user_of,
};
use crate::client::Client;
use crate::db::model::User;
use crate::db::user as users;
use crate::status::{self, Status, StatusUpdate};
use crate::upload::UploadKind;
use crate::worker::{DbCtx, DbPipeline, WorkerEnv};

pub const SALT_LEN: usize = 32;
const INCORRECT_LOGIN: &str = "Incorrect Username or Password";

/// Salted SHA-512 of a password.
pub fn hash_password(password: &str, salt: &[u8]) -> Vec<u8> {
    let mut h = Sha512::new();
    h.update(password.as_bytes());
    h.update(salt);
    h.finalize().to_vec()
}

fn new_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// How a login obtains its session.
#[derive(Debug, Clone, Copy)]
enum SessionMode {
    None,
    Create,
    Resume(u32),
}

/// Bind `user` to the client `owner` and announce it.
fn log_in(
    env: &mut WorkerEnv,
    db: &mut DbPipeline,
    owner: ClientId,
    user: User,
    mode: SessionMode,
) -> ExecResult {
    let Some(client) = owner_client(env, owner) else {
        return Ok(());
    };
    if client.is_logged_in() {
        return Err(super::REQUIRE_PERMISSION.into());
    }
    let server = Arc::clone(env.server());
    let user_id = user.user_id;
    if server.clients().bind_user(user_id, owner).is_err() {
        return Err("Someone else already logged in".into());
    }

    let session_id = match mode {
        SessionMode::None => None,
        SessionMode::Create => Some(server.sessions().create(user_id)),
        SessionMode::Resume(id) => {
            server.stop_session_timer(id);
            Some(id)
        }
    };
    info!(client = %owner, user = user_id.0, username = %user.username, "logged in");
    client.set_user(user);
    client.set_session_id(session_id);

    // Lost the race with our own disconnect.
    if server.clients().get(owner).is_none() {
        server.clients().unbind_user(user_id, owner);
        return Ok(());
    }

    env.send(owner, &json!({ "cmd": "session", "id": session_id.unwrap_or(0) }));
    status::broadcast(db, StatusUpdate::status(user_id, Status::Online))
        .map_err(super::db_error)
}

pub(super) fn register(
    _env: &mut WorkerEnv,
    db: &mut DbPipeline,
    client: &Arc<Client>,
    req: &Value,
) -> ExecResult {
    let username = field_str(req, "username")?;
    let displayname = field_str(req, "displayname")?;
    let password = field_str(req, "password")?;
    let mode = if field_bool(req, "session")? {
        SessionMode::Create
    } else {
        SessionMode::None
    };

    let salt = new_salt();
    let hash = hash_password(password, &salt);
    let ctx = DbCtx::for_owner("register", client.id()).then(move |env, db, nodes| {
        if let Some(e) = nodes[0].error() {
            debug!(error = e, "user insert failed");
            return Err("Username already taken".into());
        }
        let Some(user) = nodes[0].payload_mut().take_data::<User>() else {
            return Err("Username already taken".into());
        };
        let owner = nodes[0].owner().unwrap_or(ClientId::NONE);
        log_in(env, db, owner, user, mode)
    });
    users::insert(db, ctx, username, displayname, &hash, &salt).map_err(db_error)
}

pub(super) fn login(
    _env: &mut WorkerEnv,
    db: &mut DbPipeline,
    client: &Arc<Client>,
    req: &Value,
) -> ExecResult {
    let username = field_str(req, "username")?;
    let password = field_str(req, "password")?.to_string();
    let mode = if field_bool(req, "session")? {
        SessionMode::Create
    } else {
        SessionMode::None
    };

    let owner = client.id();
    let ctx = DbCtx::for_owner("login", owner).then(move |env, db, nodes| {
        let user = match nodes[0].payload_mut().take_data::<User>() {
            Some(user) if nodes[0].is_ok() => user,
            _ => return Err(INCORRECT_LOGIN.into()),
        };
        if hash_password(&password, &user.salt) != user.hash {
            return Err(INCORRECT_LOGIN.into());
        }
        log_in(env, db, owner, user, mode)
    });
    users::get_by_name(db, ctx, username).map_err(db_error)
}

pub(super) fn session(
    env: &mut WorkerEnv,
    db: &mut DbPipeline,
    client: &Arc<Client>,
    req: &Value,
) -> ExecResult {
    let id = field_u32(req, "id")?;
    let Some(session) = env.server().sessions().get(id) else {
        return Err("Invalid session ID or session expired".into());
    };

    let owner = client.id();
    let ctx = DbCtx::for_owner("session", owner).then(move |env, db, nodes| {
        let user = match nodes[0].payload_mut().take_data::<User>() {
            Some(user) if nodes[0].is_ok() => user,
            _ => {
                let server = Arc::clone(env.server());
                server.stop_session_timer(id);
                server.sessions().remove(id);
                return Err("Could not find user from session".into());
            }
        };
        log_in(env, db, owner, user, SessionMode::Resume(id))
    });
    users::get_by_id(db, ctx, session.user_id).map_err(db_error)
}

pub(super) fn client_user_info(
    _env: &mut WorkerEnv,
    _db: &mut DbPipeline,
    client: &Arc<Client>,
    _req: &Value,
) -> ExecResult {
    let user = client.user().ok_or(super::REQUIRE_PERMISSION)?;
    let mut frame = user.to_json(Status::Online.as_str());
    frame["cmd"] = json!("client_user_info");
    client.send_json(&frame).ok();
    Ok(())
}

/// Online users are answered from memory, the rest from the database.
pub(super) fn get_user(
    env: &mut WorkerEnv,
    db: &mut DbPipeline,
    client: &Arc<Client>,
    req: &Value,
) -> ExecResult {
    let raw = field_array(req, "user_ids")?;
    let ids: Option<Vec<UserId>> = raw
        .iter()
        .map(|v| v.as_u64().and_then(|n| u32::try_from(n).ok()).map(UserId))
        .collect();
    let ids = match ids {
        Some(ids) if !ids.is_empty() => ids,
        _ => return Err("Invalid array".into()),
    };

    let clients = env.server().clients();
    let mut online = Vec::new();
    let mut offline = Vec::new();
    for id in ids {
        match clients.for_user(id).and_then(|c| c.user()) {
            Some(user) => online.push(user.to_json(Status::Online.as_str())),
            None => offline.push(id),
        }
    }
    if !online.is_empty() {
        client
            .send_json(&json!({ "cmd": "get_user", "users": online }))
            .ok();
    }
    if offline.is_empty() {
        return Ok(());
    }

    let ctx = DbCtx::for_owner("get_user", client.id()).then(|env, _db, nodes| {
        if nodes[0].error().is_some() {
            return Err("Failed to get users".into());
        }
        let users = nodes[0]
            .payload_mut()
            .take_data::<Vec<User>>()
            .unwrap_or_default();
        let users: Vec<Value> = users
            .iter()
            .map(|u| u.to_json(Status::Offline.as_str()))
            .collect();
        if let Some(owner) = nodes[0].owner() {
            env.send(owner, &json!({ "cmd": "get_user", "users": users }));
        }
        Ok(())
    });
    users::get_many(db, ctx, &offline).map_err(db_error)
}

/// Rename and/or request a profile picture upload token.
pub(super) fn edit_account(
    env: &mut WorkerEnv,
    db: &mut DbPipeline,
    client: &Arc<Client>,
    req: &Value,
) -> ExecResult {
    let user_id = user_of(client)?;
    let new_username = opt_str(req, "new_username")?;
    let new_displayname = opt_str(req, "new_displayname")?;
    let new_pfp = opt_bool(req, "new_pfp")?.unwrap_or(false);

    if new_username.is_some() || new_displayname.is_some() {
        let ctx = DbCtx::for_owner("edit_account", client.id()).then(|env, _db, nodes| {
            let updated = match nodes[0].payload_mut().take_data::<User>() {
                Some(user) if nodes[0].is_ok() => user,
                _ => return Err("Failed to update user".into()),
            };
            let Some(client) = nodes[0].owner().and_then(|o| owner_client(env, o)) else {
                return Ok(());
            };
            client.update_user(|u| {
                u.username = updated.username.clone();
                u.displayname = updated.displayname.clone();
            });
            let mut frame = updated.to_json(Status::Online.as_str());
            frame["cmd"] = json!("client_user_info");
            client.send_json(&frame).ok();
            Ok(())
        });
        users::update(db, ctx, user_id, new_username, new_displayname).map_err(db_error)?;
    }

    if new_pfp {
        let server = env.server();
        let token = server.uploads().create(user_id, UploadKind::UserPfp);
        server.start_upload_timer(token);
        debug!(user = user_id.0, token, "profile picture token issued");
        client
            .send_json(&json!({ "cmd": "edit_account", "upload_token": token }))
            .ok();
    }
    Ok(())
}
