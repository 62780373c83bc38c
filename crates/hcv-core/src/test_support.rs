//! Test-only control over the `HCV_*` environment. Tests that use it must be
//! `#[serial]` since the process environment is shared.

use std::ffi::OsString;

const PREFIX: &str = "HCV_";

/// Snapshot of every `HCV_*` variable, cleared on creation and restored on drop,
/// so overrides set by the developer's shell never reach config tests.
pub(crate) struct HcvEnv {
    saved: Vec<(OsString, OsString)>,
}

impl HcvEnv {
    pub(crate) fn clean() -> Self {
        let saved: Vec<(OsString, OsString)> = std::env::vars_os()
            .filter(|(key, _)| key.to_string_lossy().starts_with(PREFIX))
            .collect();
        for (key, _) in &saved {
            std::env::remove_var(key);
        }
        Self { saved }
    }

    pub(crate) fn set(&self, key: &str, value: &str) -> &Self {
        debug_assert!(key.starts_with(PREFIX), "{key} is outside the HCV_ namespace");
        std::env::set_var(key, value);
        self
    }

    pub(crate) fn unset(&self, key: &str) -> &Self {
        std::env::remove_var(key);
        self
    }
}

impl Drop for HcvEnv {
    fn drop(&mut self) {
        let current: Vec<OsString> = std::env::vars_os()
            .map(|(key, _)| key)
            .filter(|key| key.to_string_lossy().starts_with(PREFIX))
            .collect();
        for key in current {
            std::env::remove_var(key);
        }
        for (key, value) in self.saved.drain(..) {
            std::env::set_var(key, value);
        }
    }
}

mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn restores_previous_values_and_drops_new_ones() {
        std::env::set_var("HCV_SUPPORT_KEPT", "outer");
        {
            let env = HcvEnv::clean();
            assert!(std::env::var("HCV_SUPPORT_KEPT").is_err());
            env.set("HCV_SUPPORT_KEPT", "inner").set("HCV_SUPPORT_NEW", "1");
            assert_eq!(std::env::var("HCV_SUPPORT_KEPT").unwrap(), "inner");
        }
        assert_eq!(std::env::var("HCV_SUPPORT_KEPT").unwrap(), "outer");
        assert!(std::env::var("HCV_SUPPORT_NEW").is_err());
        std::env::remove_var("HCV_SUPPORT_KEPT");
    }
}
