//! Server configuration.
//!
//! Layers, lowest precedence first: built-in defaults, JSON config file,
//! `CHATD_*` environment variables, command line.

use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chatd_core::env_get_opt;
use serde::Deserialize;

use crate::error::{Result, ServerError};

pub const DEFAULT_CONFIG_PATH: &str = "config.json";
pub const MAX_WORKERS: usize = 64;

pub const USAGE: &str = "\
usage: chatd [options]
  -p <port>       listen port
  -d <conninfo>   database connection string
  -4              listen on IPv4 only
  -6              listen on IPv6 (dual stack)
  -w <workers>    worker threads
  -v              verbose logging
  -f <file>       JSON config file (default: config.json)
  -h              show this help";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub root_dir: PathBuf,
    pub img_dir: Option<PathBuf>,
    pub vid_dir: Option<PathBuf>,
    pub file_dir: Option<PathBuf>,
    /// `any` or a literal address.
    pub addr_ip: String,
    pub addr_port: u16,
    pub ipv6: bool,
    pub log_level: String,
    pub database: String,
    pub workers: usize,
    pub job_queue_capacity: usize,
    pub pipeline_capacity: usize,
    pub max_frame_size: usize,
    pub session_timeout_secs: u64,
    pub upload_token_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            root_dir: PathBuf::from("."),
            img_dir: None,
            vid_dir: None,
            file_dir: None,
            addr_ip: "any".to_string(),
            addr_port: 8080,
            ipv6: true,
            log_level: "debug".to_string(),
            database: "dbname=chat".to_string(),
            workers: cpus.clamp(1, MAX_WORKERS),
            job_queue_capacity: 1024,
            pipeline_capacity: 256,
            max_frame_size: 16 * 1024 * 1024,
            session_timeout_secs: 3600,
            upload_token_secs: 10,
        }
    }
}

/// Parsed command line. `None` fields leave lower layers alone.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CliArgs {
    pub config_file: Option<PathBuf>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub ipv6: Option<bool>,
    pub workers: Option<usize>,
    pub verbose: bool,
    pub help: bool,
}

impl CliArgs {
    /// Parse arguments (without the program name).
    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = Self::default();
        let mut it = args.into_iter();
        while let Some(arg) = it.next() {
            let arg = arg.as_ref();
            let mut value = |flag: &str| {
                it.next()
                    .map(|v| v.as_ref().to_string())
                    .ok_or_else(|| ServerError::Config(format!("{flag} needs a value")))
            };
            match arg {
                "-p" => out.port = Some(parse_num(&value("-p")?, "-p")?),
                "-d" => out.database = Some(value("-d")?),
                "-4" => out.ipv6 = Some(false),
                "-6" => out.ipv6 = Some(true),
                "-w" => out.workers = Some(parse_num(&value("-w")?, "-w")?),
                "-v" => out.verbose = true,
                "-f" => out.config_file = Some(PathBuf::from(value("-f")?)),
                "-h" | "--help" => out.help = true,
                other => return Err(ServerError::Config(format!("unknown option \"{other}\""))),
            }
        }
        Ok(out)
    }
}

fn parse_num<T: std::str::FromStr>(s: &str, flag: &str) -> Result<T> {
    s.parse()
        .map_err(|_| ServerError::Config(format!("{flag}: \"{s}\" is not a valid number")))
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the full layered config for `cli`.
    pub fn load(cli: &CliArgs) -> Result<Self> {
        let mut config = match &cli.config_file {
            Some(path) => Self::from_file(path)?,
            None => match Self::from_file(Path::new(DEFAULT_CONFIG_PATH)) {
                Err(ServerError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Self::default(),
                other => other?,
            },
        };
        config.apply_env();
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|source| ServerError::ConfigFile {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn apply_env(&mut self) {
        if let Some(v) = env_get_opt("CHATD_PORT") {
            self.addr_port = v;
        }
        if let Some(v) = env_get_opt("CHATD_WORKERS") {
            self.workers = v;
        }
        if let Some(v) = env_get_opt("CHATD_DATABASE") {
            self.database = v;
        }
        if let Some(v) = env_get_opt::<String>("CHATD_ROOT_DIR") {
            self.root_dir = PathBuf::from(v);
        }
        if let Some(v) = env_get_opt("CHATD_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = env_get_opt("CHATD_JOB_QUEUE") {
            self.job_queue_capacity = v;
        }
        if let Some(v) = env_get_opt("CHATD_PIPELINE_DEPTH") {
            self.pipeline_capacity = v;
        }
    }

    pub fn apply_cli(&mut self, cli: &CliArgs) {
        if let Some(port) = cli.port {
            self.addr_port = port;
        }
        if let Some(db) = &cli.database {
            self.database = db.clone();
        }
        if let Some(ipv6) = cli.ipv6 {
            self.ipv6 = ipv6;
        }
        if let Some(workers) = cli.workers {
            self.workers = workers;
        }
        if cli.verbose {
            self.log_level = "verbose".to_string();
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.addr_port = port;
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn database(mut self, conninfo: impl Into<String>) -> Self {
        self.database = conninfo.into();
        self
    }

    pub fn root_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.root_dir = dir.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(ServerError::Config(msg.to_string()));
        if self.workers == 0 {
            return fail("workers must be at least 1");
        }
        if self.workers > MAX_WORKERS {
            return fail("workers exceeds maximum of 64");
        }
        if self.addr_port == 0 {
            return fail("addr_port must not be 0");
        }
        if self.job_queue_capacity == 0 {
            return fail("job_queue_capacity must be at least 1");
        }
        if self.pipeline_capacity == 0 {
            return fail("pipeline_capacity must be at least 1");
        }
        if self.max_frame_size == 0 {
            return fail("max_frame_size must be at least 1");
        }
        if chatd_core::log::level_directive(&self.log_level).is_none() {
            return Err(ServerError::Config(format!(
                "unknown log_level \"{}\"",
                self.log_level
            )));
        }
        self.listen_addr()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let ip = match self.addr_ip.as_str() {
            "any" | "" if self.ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            "any" | "" => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            lit => lit
                .parse()
                .map_err(|_| ServerError::Config(format!("addr_ip \"{lit}\" is not an address")))?,
        };
        Ok(SocketAddr::new(ip, self.addr_port))
    }

    fn upload_dir(&self, set: &Option<PathBuf>, leaf: &str) -> PathBuf {
        set.clone()
            .unwrap_or_else(|| self.root_dir.join("upload").join(leaf))
    }

    pub fn img_dir(&self) -> PathBuf {
        self.upload_dir(&self.img_dir, "imgs")
    }

    pub fn vid_dir(&self) -> PathBuf {
        self.upload_dir(&self.vid_dir, "vids")
    }

    pub fn file_dir(&self) -> PathBuf {
        self.upload_dir(&self.file_dir, "files")
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn upload_token_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_token_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let c = ServerConfig::default();
        c.validate().unwrap();
        assert_eq!(c.addr_port, 8080);
        assert_eq!(c.img_dir(), PathBuf::from("./upload/imgs"));
        assert_eq!(
            c.listen_addr().unwrap(),
            "[::]:8080".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_validate_rejects_zeroes() {
        assert!(ServerConfig::new().workers(0).validate().is_err());
        assert!(ServerConfig::new().port(0).validate().is_err());
        let mut c = ServerConfig::new();
        c.pipeline_capacity = 0;
        assert!(c.validate().is_err());
        let mut c = ServerConfig::new();
        c.job_queue_capacity = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_cli_parse() {
        let cli = CliArgs::parse(["-p", "9000", "-4", "-w", "3", "-v", "-d", "dbname=x"]).unwrap();
        assert_eq!(cli.port, Some(9000));
        assert_eq!(cli.ipv6, Some(false));
        assert_eq!(cli.workers, Some(3));
        assert!(cli.verbose);
        assert_eq!(cli.database.as_deref(), Some("dbname=x"));

        assert!(CliArgs::parse(["-p"]).is_err());
        assert!(CliArgs::parse(["-p", "http"]).is_err());
        assert!(CliArgs::parse(["--bogus"]).is_err());
        assert!(CliArgs::parse(["-h"]).unwrap().help);
    }

    #[test]
    fn test_file_then_cli_layering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chatd.json");
        let mut f = fs::File::create(&path).unwrap();
        write!(
            f,
            r#"{{"addr_port": 7000, "workers": 2, "database": "dbname=file", "root_dir": "/srv/chat"}}"#
        )
        .unwrap();

        let from_file = ServerConfig::from_file(&path).unwrap();
        assert_eq!(from_file.addr_port, 7000);
        assert_eq!(from_file.workers, 2);
        assert_eq!(from_file.database, "dbname=file");
        assert_eq!(from_file.vid_dir(), PathBuf::from("/srv/chat/upload/vids"));
        // Untouched fields keep their defaults
        assert_eq!(from_file.pipeline_capacity, 256);

        let cli = CliArgs::parse(["-f", path.to_str().unwrap(), "-p", "7100", "-v"]).unwrap();
        let mut layered = ServerConfig::from_file(cli.config_file.as_deref().unwrap()).unwrap();
        layered.apply_cli(&cli);
        assert_eq!(layered.addr_port, 7100);
        assert_eq!(layered.workers, 2);
        assert_eq!(layered.log_level, "verbose");
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let cli = CliArgs::parse(["-f", "/nonexistent/chatd.json"]).unwrap();
        assert!(ServerConfig::load(&cli).is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, r#"{"colour": "blue"}"#).unwrap();
        assert!(matches!(
            ServerConfig::from_file(&path),
            Err(ServerError::ConfigFile { .. })
        ));
    }
}
