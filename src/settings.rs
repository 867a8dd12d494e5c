// src/settings.rs
//
// Persisted settings: port defaults, buffer sizes, flash tool parameters.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::buffer_store::{DEFAULT_ROW_CAPACITY, DEFAULT_TERMINAL_CAPACITY};
use crate::error::{Result, SessionError};
use crate::flasher::FlashConfig;
use crate::sessions::{BufferLimits, PortOptions};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Settings {
    #[serde(default = "default_baud_rate")]
    pub default_baud_rate: u32,
    #[serde(default = "default_separator")]
    pub default_separator: String,
    #[serde(default = "default_eol")]
    pub default_eol: String, // escaped form, e.g. "\\r\\n"
    #[serde(default = "default_row_buffer_capacity")]
    pub row_buffer_capacity: usize,
    #[serde(default = "default_terminal_buffer_capacity")]
    pub terminal_buffer_capacity: usize,

    // Flashing
    #[serde(default = "default_flash_tool_path")]
    pub flash_tool_path: String,
    #[serde(default = "default_flash_touch_baud")]
    pub flash_touch_baud: u32,
    #[serde(default = "default_baud_rate")]
    pub flash_baud_rate: u32,
    #[serde(default = "default_flash_mtu")]
    pub flash_mtu: u32,
    #[serde(default = "default_flash_settle_ms")]
    pub flash_settle_ms: u64,
    #[serde(default = "default_flash_kill_grace_ms")]
    pub flash_kill_grace_ms: u64,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_baud_rate() -> u32 {
    115_200
}
fn default_separator() -> String {
    ":".to_string()
}
fn default_eol() -> String {
    "\\n".to_string()
}
fn default_row_buffer_capacity() -> usize {
    DEFAULT_ROW_CAPACITY
}
fn default_terminal_buffer_capacity() -> usize {
    DEFAULT_TERMINAL_CAPACITY
}
fn default_flash_tool_path() -> String {
    "mcumgr".to_string()
}
fn default_flash_touch_baud() -> u32 {
    1200
}
fn default_flash_mtu() -> u32 {
    128
}
fn default_flash_settle_ms() -> u64 {
    500
}
fn default_flash_kill_grace_ms() -> u64 {
    2000
}
fn default_read_timeout_ms() -> u64 {
    10
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_baud_rate: default_baud_rate(),
            default_separator: default_separator(),
            default_eol: default_eol(),
            row_buffer_capacity: default_row_buffer_capacity(),
            terminal_buffer_capacity: default_terminal_buffer_capacity(),
            flash_tool_path: default_flash_tool_path(),
            flash_touch_baud: default_flash_touch_baud(),
            flash_baud_rate: default_baud_rate(),
            flash_mtu: default_flash_mtu(),
            flash_settle_ms: default_flash_settle_ms(),
            flash_kill_grace_ms: default_flash_kill_grace_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            log_dir: None,
        }
    }
}

impl Settings {
    /// Open parameters used when a caller does not give its own
    pub fn port_options(&self) -> PortOptions {
        PortOptions {
            baud_rate: self.default_baud_rate,
            separator: self.default_separator.clone(),
            eol: self.default_eol.clone(),
        }
    }

    pub fn buffer_limits(&self) -> BufferLimits {
        BufferLimits {
            rows: self.row_buffer_capacity,
            terminal_lines: self.terminal_buffer_capacity,
        }
    }

    pub fn flash_config(&self) -> FlashConfig {
        FlashConfig {
            tool_path: self.flash_tool_path.clone(),
            touch_baud: self.flash_touch_baud,
            baud_rate: self.flash_baud_rate,
            mtu: self.flash_mtu,
            settle: Duration::from_millis(self.flash_settle_ms),
            kill_grace: Duration::from_millis(self.flash_kill_grace_ms),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// `<config dir>/serialdeck/settings.json`, creating the directory
pub fn settings_path() -> Result<PathBuf> {
    let app_dir = dirs::config_dir()
        .ok_or_else(|| SessionError::Settings("Failed to get config dir".to_string()))?
        .join("serialdeck");

    std::fs::create_dir_all(&app_dir)?;

    Ok(app_dir.join("settings.json"))
}

pub fn load_settings() -> Result<Settings> {
    load_settings_from(&settings_path()?)
}

pub fn save_settings(settings: &Settings) -> Result<()> {
    save_settings_to(&settings_path()?, settings)
}

/// Read settings from `path`. On first run the defaults are written there.
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let settings = serde_json::from_str(&content).map_err(|e| {
            tlog!("[settings] Failed to parse {}: {}", path.display(), e);
            SessionError::from(e)
        })?;
        Ok(settings)
    } else {
        tlog!("[settings] No settings at {}, writing defaults", path.display());
        let settings = Settings::default();
        save_settings_to(path, &settings)?;
        Ok(settings)
    }
}

pub fn save_settings_to(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(settings)?;

    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_first_load_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let settings = load_settings_from(&path).unwrap();
        assert_eq!(settings, Settings::default());
        assert!(path.exists());
        assert_eq!(load_settings_from(&path).unwrap(), settings);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"default_baud_rate": 9600, "flash_tool_path": "/opt/mcumgr"}"#).unwrap();

        let settings = load_settings_from(&path).unwrap();
        assert_eq!(settings.default_baud_rate, 9600);
        assert_eq!(settings.flash_tool_path, "/opt/mcumgr");
        assert_eq!(settings.default_eol, "\\n");
        assert_eq!(settings.row_buffer_capacity, 1000);
        assert_eq!(settings.flash_config().settle, Duration::from_millis(500));
    }

    #[test]
    fn test_save_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        let settings = Settings {
            default_separator: ",".into(),
            log_dir: Some(dir.path().join("logs")),
            ..Settings::default()
        };
        save_settings_to(&path, &settings).unwrap();
        assert_eq!(load_settings_from(&path).unwrap(), settings);
        assert_eq!(settings.port_options().separator, ",");
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_settings_from(&path), Err(SessionError::Settings(_))));
    }
}
