//! Client commands.
//!
//! A readable client socket yields whole frames; each frame is one JSON
//! request `{"cmd": <name>, ...}`. The command runs on the worker that
//! took the job: it validates its fields, submits database work and
//! returns. Everything a command submits forms one chain, sealed before
//! the next frame is looked at. Replies are sent from continuations,
//! which find the client again by id.

mod group;
mod message;
mod upload;
mod user;

use std::borrow::Cow;
use std::sync::Arc;

use chatd_core::{ClientId, UserId};
use chatd_pipeline::{ExecResult, PipelineError, INTERNAL_ERROR};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::client::Client;
use crate::command::Command;
use crate::db;
use crate::event::Flow;
use crate::worker::{error_frame, DbCtx, DbPipeline, WorkerEnv};

pub(crate) const NOT_FOUND: &str = "Command not found.";
pub(crate) const REQUIRE_PERMISSION: &str = "Require permission";

type Handler = fn(&mut WorkerEnv, &mut DbPipeline, &Arc<Client>, &Value) -> ExecResult;

fn handler_for(cmd: Command) -> Handler {
    match cmd {
        Command::Register => user::register,
        Command::Login => user::login,
        Command::Session => user::session,
        Command::ClientUserInfo => user::client_user_info,
        Command::GetUser => user::get_user,
        Command::EditAccount => user::edit_account,
        Command::ClientGroups => group::client_groups,
        Command::GroupCreate => group::group_create,
        Command::GetAllGroups => group::get_all_groups,
        Command::JoinGroup => group::join_group,
        Command::JoinGroupCode => group::join_group_code,
        Command::CreateGroupCode => group::create_group_code,
        Command::GetGroupCodes => group::get_group_codes,
        Command::DeleteGroupCode => group::delete_group_code,
        Command::DeleteGroup => group::delete_group,
        Command::GetMemberIds => group::get_member_ids,
        Command::GroupMsg => message::group_msg,
        Command::GetGroupMsgs => message::get_group_msgs,
        Command::DeleteMsg => message::delete_msg,
        Command::Upload => upload::upload,
    }
}

/// Read callback for a client socket.
pub fn on_readable(env: &mut WorkerEnv, db: &mut DbPipeline, client: &Arc<Client>) -> Flow {
    let read = match client.read_frames() {
        Ok(read) => read,
        Err(e) => {
            debug!(client = %client.id(), error = %e, "read failed");
            return Flow::Close;
        }
    };

    for frame in read.frames {
        let request: Value = match serde_json::from_slice(&frame) {
            Ok(v @ Value::Object(_)) => v,
            Ok(_) => {
                warn!(client = %client.id(), "request is not a JSON object");
                return Flow::Close;
            }
            Err(e) => {
                warn!(client = %client.id(), error = %e, "malformed JSON");
                return Flow::Close;
            }
        };
        execute(env, db, client, &request);
        db.chain_done(env);
    }

    if read.eof {
        Flow::Close
    } else {
        Flow::Keep
    }
}

/// Run one request, answering a refusal or failure with an error frame.
pub fn execute(env: &mut WorkerEnv, db: &mut DbPipeline, client: &Arc<Client>, request: &Value) {
    let name = request.get("cmd").and_then(Value::as_str).unwrap_or_default();
    let outcome = match name.parse::<Command>() {
        Err(()) => Err(NOT_FOUND.into()),
        Ok(cmd) if !cmd.allowed(client.is_logged_in()) => Err(REQUIRE_PERMISSION.into()),
        Ok(cmd) => {
            trace!(client = %client.id(), %cmd, "executing");
            handler_for(cmd)(env, db, client, request)
        }
    };
    if let Err(msg) = outcome {
        debug!(client = %client.id(), cmd = name, error = %msg, "request refused");
        if let Err(e) = client.send_json(&error_frame(name, &msg)) {
            debug!(client = %client.id(), error = %e, "error frame not sent");
        }
    }
}

pub(crate) fn invalid(key: &str) -> Cow<'static, str> {
    format!("\"{key}\" is invalid or not found").into()
}

pub(crate) fn field_str<'a>(req: &'a Value, key: &str) -> Result<&'a str, Cow<'static, str>> {
    req.get(key).and_then(Value::as_str).ok_or_else(|| invalid(key))
}

pub(crate) fn field_bool(req: &Value, key: &str) -> Result<bool, Cow<'static, str>> {
    req.get(key).and_then(Value::as_bool).ok_or_else(|| invalid(key))
}

pub(crate) fn field_u32(req: &Value, key: &str) -> Result<u32, Cow<'static, str>> {
    req.get(key)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| invalid(key))
}

pub(crate) fn field_i32(req: &Value, key: &str) -> Result<i32, Cow<'static, str>> {
    req.get(key)
        .and_then(Value::as_i64)
        .and_then(|n| i32::try_from(n).ok())
        .ok_or_else(|| invalid(key))
}

pub(crate) fn field_array<'a>(req: &'a Value, key: &str) -> Result<&'a Vec<Value>, Cow<'static, str>> {
    req.get(key).and_then(Value::as_array).ok_or_else(|| invalid(key))
}

/// Absent is `None`; present with the wrong type is an error.
pub(crate) fn opt_str<'a>(req: &'a Value, key: &str) -> Result<Option<&'a str>, Cow<'static, str>> {
    match req.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(invalid(key)),
    }
}

pub(crate) fn opt_bool(req: &Value, key: &str) -> Result<Option<bool>, Cow<'static, str>> {
    match req.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(invalid(key)),
    }
}

/// A submission the pipeline refused. The client sees a generic error.
pub(crate) fn db_error(e: PipelineError) -> Cow<'static, str> {
    warn!(error = %e, "query not submitted");
    INTERNAL_ERROR.into()
}

/// The logged-in user behind a handler. Permission checks run first, so
/// a missing user means it logged out underneath us.
pub(crate) fn user_of(client: &Client) -> Result<UserId, Cow<'static, str>> {
    client.user_id().ok_or_else(|| REQUIRE_PERMISSION.into())
}

/// Send `frame` to every online member of `group_id`.
pub(crate) fn broadcast_to_members(
    db: &mut DbPipeline,
    group_id: u32,
    frame: Value,
) -> chatd_pipeline::Result<()> {
    let ctx = DbCtx::new("group_broadcast").then(move |env, _db, nodes| {
        let ids = nodes[0]
            .payload_mut()
            .take_data::<Vec<UserId>>()
            .unwrap_or_default();
        let clients = env.server().clients();
        let sent = ids
            .into_iter()
            .filter(|&id| clients.send_to_user(id, &frame))
            .count();
        trace!(group_id, sent, "group broadcast");
        Ok(())
    });
    db::group::member_ids(db, ctx, group_id)
}

/// Resolve a continuation's owner, `None` once it has disconnected.
pub(crate) fn owner_client(env: &WorkerEnv, owner: ClientId) -> Option<Arc<Client>> {
    env.server().clients().get(owner)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::client::tests::{recv_frames, socket_client};
    use crate::config::ServerConfig;
    use crate::server::Server;
    use chatd_pipeline::{DbResult, Pipeline, ScriptHandle, ScriptedDriver};
    use serde_json::json;
    use std::os::unix::net::UnixStream;

    /// A server rooted in a scratch directory plus one worker's view of it.
    pub(crate) struct Harness {
        pub env: WorkerEnv,
        pub db: DbPipeline,
        pub script: ScriptHandle,
        pub server: Arc<Server>,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        pub(crate) fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = ServerConfig::new().root_dir(dir.path()).workers(1);
            let server = Server::new(config).unwrap();
            let (driver, script) = ScriptedDriver::new();
            Self {
                env: WorkerEnv::new(Arc::clone(&server), 0),
                db: Pipeline::new(Box::new(driver), 16),
                script,
                server,
                _dir: dir,
            }
        }

        /// A connected client, registered but not in epoll.
        pub(crate) fn connect(&self) -> (Arc<Client>, UnixStream) {
            let (client, peer) = socket_client(self.server.clients().next_id().0);
            self.server.clients().insert(Arc::clone(&client));
            (client, peer)
        }

        /// A connected client already logged in as `user_id`.
        pub(crate) fn login(&self, user_id: u32) -> (Arc<Client>, UnixStream) {
            let (client, peer) = self.connect();
            client.set_user(crate::client::tests::user(user_id, "u"));
            self.server
                .clients()
                .bind_user(UserId(user_id), client.id())
                .unwrap();
            (client, peer)
        }

        pub(crate) fn run(&mut self, client: &Arc<Client>, request: Value) {
            execute(&mut self.env, &mut self.db, client, &request);
            self.db.chain_done(&mut self.env);
        }

        /// Feed canned results and run whatever resolves.
        pub(crate) fn answer(&mut self, results: impl IntoIterator<Item = DbResult>) -> usize {
            self.script.push_results(results);
            self.db.drain(&mut self.env)
        }
    }

    #[test]
    fn test_unknown_command_and_permissions() {
        let mut h = Harness::new();
        let (client, mut peer) = h.connect();

        h.run(&client, json!({"cmd": "drop_table"}));
        h.run(&client, json!({"cmd": "group_msg", "group_id": 1, "content": "hi"}));
        h.run(&client, json!({"nocmd": true}));

        let got = recv_frames(&mut peer);
        assert_eq!(got.len(), 3);
        assert_eq!(got[0]["cmd"], "error");
        assert_eq!(got[0]["from"], "drop_table");
        assert_eq!(got[0]["error_msg"], NOT_FOUND);
        assert_eq!(got[1]["from"], "group_msg");
        assert_eq!(got[1]["error_msg"], REQUIRE_PERMISSION);
        assert_eq!(got[2]["error_msg"], NOT_FOUND);
        assert_eq!(h.script.sent_count(), 0);
    }

    #[test]
    fn test_logged_in_client_cannot_login_again() {
        let mut h = Harness::new();
        let (client, mut peer) = h.login(5);
        h.run(&client, json!({"cmd": "login", "username": "a", "password": "b", "session": false}));
        let got = recv_frames(&mut peer);
        assert_eq!(got[0]["error_msg"], REQUIRE_PERMISSION);
    }

    #[test]
    fn test_missing_field_message() {
        let mut h = Harness::new();
        let (client, mut peer) = h.login(5);
        h.run(&client, json!({"cmd": "get_member_ids", "group_id": "x"}));
        let got = recv_frames(&mut peer);
        assert_eq!(got[0]["error_msg"], "\"group_id\" is invalid or not found");
    }

    #[test]
    fn test_field_helpers() {
        let req = json!({"s": "a", "b": true, "n": 7, "neg": -1, "big": 5_000_000_000u64, "nul": null});
        assert_eq!(field_str(&req, "s").unwrap(), "a");
        assert!(field_str(&req, "n").is_err());
        assert!(field_bool(&req, "b").unwrap());
        assert_eq!(field_u32(&req, "n").unwrap(), 7);
        assert!(field_u32(&req, "neg").is_err());
        assert!(field_u32(&req, "big").is_err());
        assert_eq!(field_i32(&req, "neg").unwrap(), -1);
        assert_eq!(opt_str(&req, "missing").unwrap(), None);
        assert_eq!(opt_str(&req, "nul").unwrap(), None);
        assert!(opt_str(&req, "n").is_err());
        assert_eq!(opt_bool(&req, "b").unwrap(), Some(true));
    }
}
