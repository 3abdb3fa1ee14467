//! Environment variable utilities
//!
//! Typed lookups with defaults, used by the config layer for `CHATD_*`
//! overrides.
//!
//! # Usage
//!
//! ```ignore
//! use chatd_core::env::{env_get, env_get_bool, env_get_opt};
//!
//! let workers: usize = env_get("CHATD_WORKERS", 4);
//! let port: Option<u16> = env_get_opt("CHATD_PORT");
//! let ipv6 = env_get_bool("CHATD_IPV6", true);
//! ```

use std::str::FromStr;

/// Parse `key` as `T`, falling back to `default` when unset or unparsable.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// `Some(T)` only when `key` is set and parses.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean lookup.
///
/// "1", "true", "yes", "on" are true and "0", "false", "no", "off" are
/// false (case-insensitive). Anything else, including unset, is `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__CHATD_TEST_UNSET_1__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_opt_none() {
        let val: Option<u16> = env_get_opt("__CHATD_TEST_UNSET_2__");
        assert!(val.is_none());
    }

    #[test]
    fn test_env_get_with_set_var() {
        std::env::set_var("__CHATD_TEST_PORT__", " 9090 ");
        let val: u16 = env_get("__CHATD_TEST_PORT__", 0);
        assert_eq!(val, 9090);
        std::env::remove_var("__CHATD_TEST_PORT__");
    }

    #[test]
    fn test_env_get_unparsable_falls_back() {
        std::env::set_var("__CHATD_TEST_BAD__", "many");
        let val: usize = env_get("__CHATD_TEST_BAD__", 3);
        assert_eq!(val, 3);
        std::env::remove_var("__CHATD_TEST_BAD__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        std::env::set_var("__CHATD_TEST_BOOL__", "YES");
        assert!(env_get_bool("__CHATD_TEST_BOOL__", false));
        std::env::set_var("__CHATD_TEST_BOOL__", "off");
        assert!(!env_get_bool("__CHATD_TEST_BOOL__", true));
        std::env::set_var("__CHATD_TEST_BOOL__", "maybe");
        assert!(env_get_bool("__CHATD_TEST_BOOL__", true));
        std::env::remove_var("__CHATD_TEST_BOOL__");
        assert!(!env_get_bool("__CHATD_TEST_BOOL__", false));
    }
}
