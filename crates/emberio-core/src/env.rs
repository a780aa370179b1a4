//! Environment variable parsing helpers.
//!
//! Generic `env_get<T>` with a default, used by the engine config.
//!
//! ```ignore
//! let workers: usize = env_get("EMB_WORKERS", 4);
//! let debug = env_get_bool("EMB_DEBUG", false);
//! ```

use std::str::FromStr;

/// Get an environment variable parsed as `T`, or the default on
/// unset/unparsable values.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Boolean helper: "1", "true", "yes", "on" (case-insensitive) are true;
/// any other set value is false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// `Some(T)` if set and parsable, `None` otherwise.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_returns_default() {
        let val: usize = env_get("__EMB_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        assert!(env_get_bool("__EMB_TEST_UNSET__", true));
        let opt: Option<u16> = env_get_opt("__EMB_TEST_UNSET__");
        assert!(opt.is_none());
    }

    #[test]
    fn set_values_parse() {
        std::env::set_var("__EMB_TEST_NUM__", "123");
        let val: usize = env_get("__EMB_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__EMB_TEST_NUM__");
    }

    #[test]
    fn bad_parse_returns_default() {
        std::env::set_var("__EMB_TEST_BAD__", "not_a_number");
        let val: usize = env_get("__EMB_TEST_BAD__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__EMB_TEST_BAD__");
    }

    #[test]
    fn bool_variants() {
        std::env::set_var("__EMB_TEST_BOOL__", "on");
        assert!(env_get_bool("__EMB_TEST_BOOL__", false));
        std::env::set_var("__EMB_TEST_BOOL__", "0");
        assert!(!env_get_bool("__EMB_TEST_BOOL__", true));
        std::env::remove_var("__EMB_TEST_BOOL__");
    }
}
