//! Logging bootstrap.
//!
//! All crates log through `tracing` macros. This module installs the
//! `tracing-subscriber` fmt layer once per process.
//!
//! # Environment Variables
//!
//! - `CHATD_LOG=<filter>` - full `EnvFilter` directive, wins over the
//!   configured level (e.g. `CHATD_LOG=chatd_pipeline=trace,info`)
//!
//! # Levels
//!
//! The config file uses the server's historical level names:
//!
//! | config    | tracing |
//! |-----------|---------|
//! | `fatal`   | error   |
//! | `error`   | error   |
//! | `warn`    | warn    |
//! | `info`    | info    |
//! | `verbose` | debug   |
//! | `debug`   | trace   |

use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;

/// Environment variable holding a full filter directive.
pub const LOG_ENV: &str = "CHATD_LOG";

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Map a config level name onto a `tracing` level directive.
///
/// Unknown names yield `None`.
pub fn level_directive(name: &str) -> Option<&'static str> {
    match name.trim().to_ascii_lowercase().as_str() {
        "fatal" | "error" => Some("error"),
        "warn" | "warning" => Some("warn"),
        "info" => Some("info"),
        "verbose" => Some("debug"),
        "debug" | "trace" => Some("trace"),
        "off" | "none" => Some("off"),
        _ => None,
    }
}

/// Install the global subscriber.
///
/// `level` is the configured level name; `CHATD_LOG` overrides it.
/// Later calls are no-ops.
pub fn init(level: Option<&str>) {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    let directive = level.and_then(level_directive).unwrap_or("info");
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(directive));

    // Another subscriber (a test harness, an embedding binary) may already
    // be installed; keep it.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_directive_mapping() {
        assert_eq!(level_directive("fatal"), Some("error"));
        assert_eq!(level_directive("Verbose"), Some("debug"));
        assert_eq!(level_directive("debug"), Some("trace"));
        assert_eq!(level_directive(" info "), Some("info"));
        assert_eq!(level_directive("loud"), None);
    }

    #[test]
    fn test_init_twice_is_noop() {
        init(Some("warn"));
        init(Some("debug"));
        assert!(INITIALIZED.load(Ordering::SeqCst));
    }
}
