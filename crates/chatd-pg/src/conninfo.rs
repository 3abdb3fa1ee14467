//! libpq-style `keyword=value` connection strings.
//!
//! Missing keywords fall back to `PGHOST`, `PGPORT`, `PGUSER`,
//! `PGPASSWORD`, `PGDATABASE`, then `USER`. A host starting with `/` is a
//! Unix socket directory.

use std::path::PathBuf;

use chatd_core::env_get_opt;

use crate::error::{PgError, Result};

pub const DEFAULT_PORT: u16 = 5432;
const DEFAULT_SOCKET_DIR: &str = "/var/run/postgresql";

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub dbname: String,
    pub application_name: String,
}

impl ConnConfig {
    /// Parse a connection string, filling gaps from the environment.
    pub fn parse(conninfo: &str) -> Result<Self> {
        let mut host = None;
        let mut port = None;
        let mut user = None;
        let mut password = None;
        let mut dbname = None;
        let mut application_name = None;

        for (key, value) in tokenize(conninfo)? {
            match key.as_str() {
                "host" | "hostaddr" => host = Some(value),
                "port" => {
                    port = Some(
                        value
                            .parse::<u16>()
                            .map_err(|_| PgError::Config(format!("invalid port \"{value}\"")))?,
                    )
                }
                "user" => user = Some(value),
                "password" => password = Some(value),
                "dbname" => dbname = Some(value),
                "application_name" => application_name = Some(value),
                // Accepted and ignored, like the timeouts and sslmode of
                // a shared config file.
                "connect_timeout" | "sslmode" | "options" | "client_encoding" => {}
                other => return Err(PgError::Config(format!("unknown keyword \"{other}\""))),
            }
        }

        let user = user
            .or_else(|| env_get_opt::<String>("PGUSER"))
            .or_else(|| env_get_opt::<String>("USER"))
            .unwrap_or_else(|| "postgres".to_string());
        let dbname = dbname
            .or_else(|| env_get_opt::<String>("PGDATABASE"))
            .unwrap_or_else(|| user.clone());
        let host = host
            .or_else(|| env_get_opt::<String>("PGHOST"))
            .unwrap_or_else(default_host);

        Ok(Self {
            host,
            port: port
                .or_else(|| env_get_opt::<u16>("PGPORT"))
                .unwrap_or(DEFAULT_PORT),
            user,
            password: password.or_else(|| env_get_opt::<String>("PGPASSWORD")),
            dbname,
            application_name: application_name.unwrap_or_else(|| "chatd".to_string()),
        })
    }

    pub fn target(&self) -> Target {
        if self.host.starts_with('/') {
            Target::Unix(PathBuf::from(format!("{}/.s.PGSQL.{}", self.host, self.port)))
        } else {
            Target::Tcp {
                host: self.host.clone(),
                port: self.port,
            }
        }
    }
}

fn default_host() -> String {
    if std::path::Path::new(DEFAULT_SOCKET_DIR).is_dir() {
        DEFAULT_SOCKET_DIR.to_string()
    } else {
        "localhost".to_string()
    }
}

/// Split `a=1 b='two words' c=it\'s` into pairs.
fn tokenize(s: &str) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    let mut chars = s.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c.is_whitespace() {
                break;
            }
            key.push(c);
            chars.next();
        }
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.next() != Some('=') {
            return Err(PgError::Config(format!("missing \"=\" after \"{key}\"")));
        }
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }

        let mut value = String::new();
        if chars.peek() == Some(&'\'') {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '\'' => {
                        closed = true;
                        break;
                    }
                    _ => value.push(c),
                }
            }
            if !closed {
                return Err(PgError::Config("unterminated quoted value".into()));
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                chars.next();
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        value.push(escaped);
                    }
                } else {
                    value.push(c);
                }
            }
        }
        out.push((key, value));
    }
    Ok(out)
}
