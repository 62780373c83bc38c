/// Parse a boolean-like environment flag.
/// Accepts common values such as 1/0, true/false, yes/no, on/off (case-insensitive).
pub fn parse_bool_flag(raw: &str) -> Option<bool> {
    let normalized = raw.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Read an environment variable and parse it as a boolean flag using [`parse_bool_flag`].
pub fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .and_then(|raw| parse_bool_flag(&raw))
}

/// Milliseconds since the unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Lowercase sha256 hex digest.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hcv_kernel::sha256_hex(bytes)
}

/// Trailing-`*` wildcard match; without a `*` the pattern must match exactly.
pub fn wildcard_match(pattern: &str, key: &str) -> bool {
    if let Some(pfx) = pattern.strip_suffix('*') {
        key.starts_with(pfx)
    } else {
        pattern == key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::HcvEnv;
    use serial_test::serial;

    #[test]
    fn parse_bool_flag_recognizes_common_values() {
        assert_eq!(parse_bool_flag("true"), Some(true));
        assert_eq!(parse_bool_flag("YES"), Some(true));
        assert_eq!(parse_bool_flag("0"), Some(false));
        assert_eq!(parse_bool_flag("off"), Some(false));
        assert_eq!(parse_bool_flag("maybe"), None);
        assert_eq!(parse_bool_flag(""), None);
    }

    #[test]
    #[serial]
    fn env_bool_reads_env() {
        let env = HcvEnv::clean();
        env.set("HCV_TEST_BOOL", "on");
        assert_eq!(env_bool("HCV_TEST_BOOL"), Some(true));
        env.set("HCV_TEST_BOOL", "No");
        assert_eq!(env_bool("HCV_TEST_BOOL"), Some(false));
        env.unset("HCV_TEST_BOOL");
        assert_eq!(env_bool("HCV_TEST_BOOL"), None);
    }

    #[test]
    fn wildcard_prefix_and_exact() {
        assert!(wildcard_match("team/*", "team/db/password"));
        assert!(!wildcard_match("team/*", "other/db"));
        assert!(wildcard_match("exact/key", "exact/key"));
        assert!(!wildcard_match("exact/key", "exact/key2"));
        assert!(wildcard_match("*", "anything"));
    }
}
