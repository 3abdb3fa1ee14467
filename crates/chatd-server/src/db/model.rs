//! Row types and their decoders.

use chatd_core::UserId;
use chatd_pipeline::DbResult;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

fn text(res: &DbResult, row: usize, col: &str) -> Result<String, String> {
    res.value_by_name(row, col)
        .map(str::to_string)
        .ok_or_else(|| format!("column \"{col}\" missing or null"))
}

fn opt_text(res: &DbResult, row: usize, col: &str) -> Option<String> {
    res.value_by_name(row, col).map(str::to_string)
}

fn num<T: std::str::FromStr>(res: &DbResult, row: usize, col: &str) -> Result<T, String> {
    res.parse_by_name(row, col)
        .ok_or_else(|| format!("column \"{col}\" is not a number"))
}

fn boolean(res: &DbResult, row: usize, col: &str) -> Result<bool, String> {
    match res.value_by_name(row, col) {
        Some("t") => Ok(true),
        Some("f") => Ok(false),
        _ => Err(format!("column \"{col}\" is not a boolean")),
    }
}

/// Decode a `bytea` in text output format (`\x` + hex).
pub fn bytea(s: &str) -> Result<Vec<u8>, String> {
    let hex_part = s
        .strip_prefix("\\x")
        .ok_or_else(|| "bytea without \\x prefix".to_string())?;
    hex::decode(hex_part).map_err(|e| format!("bad bytea: {e}"))
}

/// Collect every row of `res` with `f`.
pub fn all_rows<T>(
    res: &DbResult,
    f: impl Fn(&DbResult, usize) -> Result<T, String>,
) -> Result<Vec<T>, String> {
    (0..res.ntuples()).map(|row| f(res, row)).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub user_id: UserId,
    pub username: String,
    pub displayname: String,
    pub bio: String,
    pub created_at: String,
    pub pfp_hash: Option<String>,
    pub hash: Vec<u8>,
    pub salt: Vec<u8>,
}

impl User {
    pub fn from_row(res: &DbResult, row: usize) -> Result<Self, String> {
        Ok(Self {
            user_id: UserId(num(res, row, "user_id")?),
            username: text(res, row, "username")?,
            displayname: text(res, row, "displayname")?,
            bio: opt_text(res, row, "bio").unwrap_or_default(),
            created_at: opt_text(res, row, "created_at").unwrap_or_default(),
            pfp_hash: opt_text(res, row, "pfp_hash"),
            hash: bytea(&text(res, row, "hash")?)?,
            salt: bytea(&text(res, row, "salt")?)?,
        })
    }

    /// Public profile; credentials never leave the server.
    pub fn to_json(&self, status: &str) -> Value {
        json!({
            "user_id": self.user_id.0,
            "username": self.username,
            "displayname": self.displayname,
            "bio": self.bio,
            "created_at": self.created_at,
            "pfp_name": self.pfp_hash,
            "status": status,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Group {
    pub group_id: u32,
    pub owner_id: u32,
    pub name: String,
    pub desc: String,
    pub public: bool,
}

impl Group {
    pub fn from_row(res: &DbResult, row: usize) -> Result<Self, String> {
        Ok(Self {
            group_id: num(res, row, "group_id")?,
            owner_id: num(res, row, "owner_id")?,
            name: text(res, row, "name")?,
            desc: opt_text(res, row, "desc").unwrap_or_default(),
            public: boolean(res, row, "public")?,
        })
    }
}

/// One entry of a message's `attachments` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub msg_id: u32,
    pub group_id: u32,
    pub user_id: u32,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub timestamp: String,
}

impl Message {
    pub fn from_row(res: &DbResult, row: usize) -> Result<Self, String> {
        let attachments = match res.value_by_name(row, "attachments") {
            Some(raw) => serde_json::from_str(raw).map_err(|e| format!("attachments: {e}"))?,
            None => Vec::new(),
        };
        Ok(Self {
            msg_id: num(res, row, "msg_id")?,
            group_id: num(res, row, "group_id")?,
            user_id: num(res, row, "user_id")?,
            content: text(res, row, "content")?,
            attachments,
            timestamp: opt_text(res, row, "timestamp").unwrap_or_default(),
        })
    }

    pub fn to_json(&self) -> Value {
        let mut v = json!({ "cmd": "group_msg" });
        if let (Value::Object(out), Ok(Value::Object(fields))) =
            (&mut v, serde_json::to_value(self))
        {
            out.extend(fields);
        }
        v
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupCode {
    pub code: String,
    pub uses: i32,
    pub max_uses: i32,
}

impl GroupCode {
    pub fn from_row(res: &DbResult, row: usize) -> Result<Self, String> {
        Ok(Self {
            code: text(res, row, "invite_code")?,
            uses: num(res, row, "uses")?,
            max_uses: num(res, row, "max_uses")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_result() -> DbResult {
        DbResult::tuples(
            ["user_id", "username", "displayname", "bio", "hash", "salt", "created_at", "pfp_hash"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            vec![vec![
                Some("7".into()),
                Some("ann".into()),
                Some("Ann".into()),
                None,
                Some("\\xdeadbeef".into()),
                Some("\\x0102".into()),
                Some("2024-01-01 00:00:00+00".into()),
                None,
            ]],
        )
    }

    #[test]
    fn test_user_from_row() {
        let u = User::from_row(&user_result(), 0).unwrap();
        assert_eq!(u.user_id, UserId(7));
        assert_eq!(u.hash, vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(u.salt, vec![1, 2]);
        assert_eq!(u.bio, "");
        let j = u.to_json("online");
        assert_eq!(j["username"], "ann");
        assert_eq!(j["status"], "online");
        assert!(j["pfp_name"].is_null());
        assert!(j.get("hash").is_none());
    }

    #[test]
    fn test_bytea() {
        assert_eq!(bytea("\\x00ff").unwrap(), vec![0, 255]);
        assert!(bytea("00ff").is_err());
        assert!(bytea("\\xzz").is_err());
    }

    #[test]
    fn test_message_json() {
        let res = DbResult::tuples(
            ["msg_id", "group_id", "user_id", "content", "attachments", "timestamp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            vec![vec![
                Some("3".into()),
                Some("1".into()),
                Some("7".into()),
                Some("hi".into()),
                Some(r#"[{"name":"a.png","type":"image/png","hash":"ab","size":4}]"#.into()),
                Some("now".into()),
            ]],
        );
        let m = Message::from_row(&res, 0).unwrap();
        assert_eq!(m.attachments[0].mime_type, "image/png");
        let j = m.to_json();
        assert_eq!(j["cmd"], "group_msg");
        assert_eq!(j["msg_id"], 3);
        assert_eq!(j["attachments"][0]["type"], "image/png");
    }

    #[test]
    fn test_group_from_row() {
        let res = DbResult::tuples(
            ["group_id", "owner_id", "name", "desc", "public"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            vec![vec![
                Some("4".into()),
                Some("7".into()),
                Some("rust".into()),
                Some("".into()),
                Some("t".into()),
            ]],
        );
        let g = Group::from_row(&res, 0).unwrap();
        assert!(g.public);
        assert_eq!(serde_json::to_value(&g).unwrap()["name"], "rust");
    }
}
