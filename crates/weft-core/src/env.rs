//! Environment variable utilities
//!
//! Configuration values arrive through `WEFT_*` environment variables,
//! parsed with a default fallback.

use std::str::FromStr;

/// Parse an environment variable as `T`.
///
/// Falls back to `default` when the variable is unset or does not parse.
#[inline]
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse an environment variable as a switch.
///
/// Accepts the usual spellings, case-insensitive: "1"/"0", "true"/"false",
/// "yes"/"no", "on"/"off". Anything else falls back to `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    env_get(key, Switch(default)).0
}

/// Newtype so `env_get` can parse the switch spellings that `bool`'s own
/// `FromStr` rejects
struct Switch(bool);

impl FromStr for Switch {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Switch(true)),
            "0" | "false" | "no" | "off" => Ok(Switch(false)),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__WEFT_TEST_UNSET__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_set() {
        std::env::set_var("__WEFT_TEST_NUM__", " 123 ");
        let val: usize = env_get("__WEFT_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__WEFT_TEST_NUM__");
    }

    #[test]
    fn test_env_get_invalid_parse() {
        std::env::set_var("__WEFT_TEST_BAD__", "not_a_number");
        let val: usize = env_get("__WEFT_TEST_BAD__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__WEFT_TEST_BAD__");
    }

    #[test]
    fn test_env_get_bool_spellings() {
        for (raw, expect) in [
            ("1", true),
            ("YES", true),
            ("on", true),
            ("true", true),
            ("0", false),
            ("no", false),
            ("OFF", false),
            ("false", false),
        ] {
            std::env::set_var("__WEFT_TEST_BOOL__", raw);
            assert_eq!(env_get_bool("__WEFT_TEST_BOOL__", !expect), expect, "{:?}", raw);
        }
        std::env::remove_var("__WEFT_TEST_BOOL__");
    }

    #[test]
    fn test_env_get_bool_fallback() {
        std::env::remove_var("__WEFT_TEST_BOOL2__");
        assert!(env_get_bool("__WEFT_TEST_BOOL2__", true));
        assert!(!env_get_bool("__WEFT_TEST_BOOL2__", false));

        // Unrecognized spellings keep the default.
        std::env::set_var("__WEFT_TEST_BOOL2__", "garbage");
        assert!(env_get_bool("__WEFT_TEST_BOOL2__", true));
        assert!(!env_get_bool("__WEFT_TEST_BOOL2__", false));
        std::env::remove_var("__WEFT_TEST_BOOL2__");
    }
}
