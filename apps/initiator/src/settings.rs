//! Settings loading from a JSON file.
//!
//! Reads `settings.json` from `~/.config/mtp-initiator/` (or the platform
//! equivalent), or from the path in `MTP_INITIATOR_SETTINGS`. Missing or
//! malformed files fall back to defaults.

use log::{debug, warn};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::session::{DEFAULT_OPEN_TIMEOUT_SECS, DEFAULT_TRANSFER_TIMEOUT_SECS, ManagerOptions, PermissionPolicy};

/// Environment variable that overrides the settings file location.
pub const SETTINGS_PATH_ENV: &str = "MTP_INITIATOR_SETTINGS";

/// User settings.
/// Note: Uses serde aliases to support both camelCase and snake_case keys
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    #[serde(alias = "autoRequestPermission", default = "default_true")]
    pub auto_request_permission: bool,
    #[serde(alias = "autoOpen", default = "default_true")]
    pub auto_open: bool,
    #[serde(alias = "openTimeoutSecs", default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,
    #[serde(alias = "transferTimeoutSecs", default = "default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,
    /// Answers to permission prompts.
    #[serde(default)]
    pub permission: PermissionPolicy,
    #[serde(default)]
    pub demo: DemoSettings,
}

/// The write/read round trip run on every newly opened session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DemoSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(alias = "fileName", default = "default_file_name")]
    pub file_name: String,
    #[serde(default = "default_content")]
    pub content: String,
    /// Delete a root-level file with the same name first.
    #[serde(alias = "replaceExisting", default = "default_true")]
    pub replace_existing: bool,
}

fn default_true() -> bool {
    true
}

fn default_open_timeout_secs() -> u64 {
    DEFAULT_OPEN_TIMEOUT_SECS
}

fn default_transfer_timeout_secs() -> u64 {
    DEFAULT_TRANSFER_TIMEOUT_SECS
}

fn default_file_name() -> String {
    "mtp-initiator-test.txt".to_string()
}

fn default_content() -> String {
    "This test content.".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_request_permission: true,
            auto_open: true,
            open_timeout_secs: DEFAULT_OPEN_TIMEOUT_SECS,
            transfer_timeout_secs: DEFAULT_TRANSFER_TIMEOUT_SECS,
            permission: PermissionPolicy::default(),
            demo: DemoSettings::default(),
        }
    }
}

impl Default for DemoSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            file_name: default_file_name(),
            content: default_content(),
            replace_existing: true,
        }
    }
}

impl Settings {
    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            auto_request_permission: self.auto_request_permission,
            auto_open: self.auto_open,
            open_timeout: Duration::from_secs(self.open_timeout_secs.max(1)),
            transfer_timeout: Duration::from_secs(self.transfer_timeout_secs.max(1)),
        }
    }
}

/// Where settings are read from.
pub fn settings_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(SETTINGS_PATH_ENV) {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join("mtp-initiator").join("settings.json"))
}

/// Loads settings from the default location.
/// Returns defaults if the file doesn't exist or can't be parsed.
pub fn load_settings() -> Settings {
    match settings_path() {
        Some(path) => load_settings_from(&path),
        None => {
            debug!("No config directory on this platform, using default settings");
            Settings::default()
        }
    }
}

/// Loads settings from `path`, falling back to defaults.
pub fn load_settings_from(path: &Path) -> Settings {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            debug!("No settings at {} ({}), using defaults", path.display(), e);
            return Settings::default();
        }
    };
    match serde_json::from_str(&contents) {
        Ok(settings) => {
            debug!("Loaded settings from {}", path.display());
            settings
        }
        Err(e) => {
            warn!("Couldn't parse settings at {}: {}. Using defaults", path.display(), e);
            Settings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_settings(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from(&dir.path().join("settings.json"));
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_malformed_file_gives_defaults() {
        let file = write_settings("{ not json");
        assert_eq!(load_settings_from(file.path()), Settings::default());
    }

    #[test]
    fn test_camel_case_keys() {
        let file = write_settings(
            r#"{
                "autoOpen": false,
                "openTimeoutSecs": 5,
                "permission": {"mode": "allowVendors", "vendorIds": [6353]},
                "demo": {"fileName": "hello.txt", "replaceExisting": false}
            }"#,
        );
        let settings = load_settings_from(file.path());

        assert!(!settings.auto_open);
        assert!(settings.auto_request_permission);
        assert_eq!(settings.open_timeout_secs, 5);
        assert_eq!(settings.transfer_timeout_secs, DEFAULT_TRANSFER_TIMEOUT_SECS);
        assert_eq!(
            settings.permission,
            PermissionPolicy::AllowVendors {
                vendor_ids: vec![0x18d1]
            }
        );
        assert_eq!(settings.demo.file_name, "hello.txt");
        assert!(!settings.demo.replace_existing);
        assert_eq!(settings.demo.content, "This test content.");
        assert!(settings.demo.enabled);
    }

    #[test]
    fn test_snake_case_keys() {
        let file = write_settings(r#"{"auto_request_permission": false, "transfer_timeout_secs": 60}"#);
        let settings = load_settings_from(file.path());
        assert!(!settings.auto_request_permission);
        assert_eq!(settings.transfer_timeout_secs, 60);
    }

    #[test]
    fn test_manager_options() {
        let settings = Settings {
            auto_open: false,
            open_timeout_secs: 0,
            transfer_timeout_secs: 90,
            ..Settings::default()
        };
        let options = settings.manager_options();
        assert!(!options.auto_open);
        assert!(options.auto_request_permission);
        assert_eq!(options.open_timeout, Duration::from_secs(1));
        assert_eq!(options.transfer_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_default_options_match_manager_defaults() {
        assert_eq!(Settings::default().manager_options(), ManagerOptions::default());
    }
}
