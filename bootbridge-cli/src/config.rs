//! Configuration file support for bootbridge.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (BOOTBRIDGE_*)
//! 3. Local config file (./bootbridge.toml)
//! 4. Global config file (~/.config/bootbridge/config.toml)

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bootbridge::{EngineConfig, Line, LineBootControl};
use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::CliError;

/// Serial port configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub serial: Option<String>,
    /// Baud rate.
    pub baud: Option<u32>,
}

/// Flash session configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Directory the image is staged in before flashing.
    pub staging_dir: Option<PathBuf>,
    /// SYNC attempts before giving up.
    pub max_sync_attempts: Option<u32>,
    /// Response timeout for INFO, ERASE, WRITE and SEAL.
    pub command_timeout_ms: Option<u64>,
    /// Drive boot-select and reset through the port's modem lines.
    #[serde(default)]
    pub reset_lines: bool,
    /// Line wired to boot-select ("dtr" or "rts").
    pub boot_select_line: Option<String>,
    /// Line wired to reset ("dtr" or "rts").
    pub reset_line: Option<String>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Flash configuration.
    #[serde(default)]
    pub flash: FlashConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Local config overrides global
        if let Some(local_config) = Self::load_from_file(Path::new("bootbridge.toml")) {
            debug!("Loaded local config from bootbridge.toml");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "bootbridge").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Default staging directory when none is configured.
    pub fn default_staging_dir() -> PathBuf {
        ProjectDirs::from("", "", "bootbridge").map_or_else(
            || std::env::temp_dir().join("bootbridge"),
            |dirs| dirs.data_local_dir().join("staging"),
        )
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.port.serial.is_some() {
            self.port.serial = other.port.serial;
        }
        if other.port.baud.is_some() {
            self.port.baud = other.port.baud;
        }

        if other.flash.staging_dir.is_some() {
            self.flash.staging_dir = other.flash.staging_dir;
        }
        if other.flash.max_sync_attempts.is_some() {
            self.flash.max_sync_attempts = other.flash.max_sync_attempts;
        }
        if other.flash.command_timeout_ms.is_some() {
            self.flash.command_timeout_ms = other.flash.command_timeout_ms;
        }
        if other.flash.reset_lines {
            self.flash.reset_lines = true;
        }
        if other.flash.boot_select_line.is_some() {
            self.flash.boot_select_line = other.flash.boot_select_line;
        }
        if other.flash.reset_line.is_some() {
            self.flash.reset_line = other.flash.reset_line;
        }
    }

    /// Engine settings with the configured overrides applied.
    pub fn engine_config(&self) -> EngineConfig {
        let mut engine = EngineConfig::default();
        if let Some(attempts) = self.flash.max_sync_attempts {
            engine = engine.with_max_sync_attempts(attempts);
        }
        if let Some(ms) = self.flash.command_timeout_ms {
            engine = engine.with_command_timeout(Duration::from_millis(ms));
        }
        engine
    }

    /// Boot-line control, when enabled.
    pub fn boot_control(&self) -> Result<Option<LineBootControl>, CliError> {
        if !self.flash.reset_lines {
            return Ok(None);
        }
        let defaults = LineBootControl::default();
        let boot_select = parse_line(self.flash.boot_select_line.as_deref(), defaults.boot_select)?;
        let reset = parse_line(self.flash.reset_line.as_deref(), defaults.reset)?;
        LineBootControl::new(boot_select, reset)
            .map(Some)
            .map_err(|e| CliError::Config(e.to_string()))
    }
}

fn parse_line(value: Option<&str>, default: Line) -> Result<Line, CliError> {
    value.map_or(Ok(default), |v| {
        v.parse().map_err(|e: bootbridge::Error| CliError::Config(e.to_string()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.port.serial.is_none());
        assert!(config.port.baud.is_none());
        assert!(config.flash.staging_dir.is_none());
        assert!(!config.flash.reset_lines);
        assert_eq!(config.engine_config(), EngineConfig::default());
    }

    #[test]
    fn test_config_merge_overrides() {
        let mut base = Config::default();
        base.port.baud = Some(115_200);

        let mut other = Config::default();
        other.port.serial = Some("/dev/ttyACM0".to_string());
        other.port.baud = Some(921_600);
        other.flash.reset_lines = true;

        base.merge(other);
        assert_eq!(base.port.serial.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(base.port.baud, Some(921_600));
        assert!(base.flash.reset_lines);
    }

    #[test]
    fn test_config_merge_does_not_overwrite_with_none() {
        let mut base = Config::default();
        base.port.serial = Some("/dev/ttyACM0".to_string());
        base.flash.max_sync_attempts = Some(3);

        base.merge(Config::default());

        assert_eq!(base.port.serial.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(base.flash.max_sync_attempts, Some(3));
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[port]
serial = "/dev/ttyACM0"
baud = 921600

[flash]
staging_dir = "/srv/firmware"
max_sync_attempts = 4
command_timeout_ms = 8000
reset_lines = true
boot_select_line = "rts"
reset_line = "dtr"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.port.serial.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.port.baud, Some(921_600));
        assert_eq!(
            config.flash.staging_dir.as_deref(),
            Some(Path::new("/srv/firmware"))
        );

        let engine = config.engine_config();
        assert_eq!(engine.max_sync_attempts, 4);
        assert_eq!(engine.command_timeout, Duration::from_secs(8));

        let control = config.boot_control().unwrap().unwrap();
        assert_eq!(control.boot_select, Line::Rts);
        assert_eq!(control.reset, Line::Dtr);
    }

    #[test]
    fn test_config_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.port.serial.is_none());
        assert!(config.boot_control().unwrap().is_none());
    }

    #[test]
    fn test_boot_control_rejects_unknown_line() {
        let mut config = Config::default();
        config.flash.reset_lines = true;
        config.flash.reset_line = Some("cts".to_string());
        assert!(matches!(config.boot_control(), Err(CliError::Config(_))));
    }

    #[test]
    fn test_boot_control_rejects_shared_line() {
        let mut config = Config::default();
        config.flash.reset_lines = true;
        config.flash.boot_select_line = Some("rts".to_string());
        assert!(matches!(config.boot_control(), Err(CliError::Config(_))));
    }

    #[test]
    fn test_load_from_path_valid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(
            &path,
            r#"
[port]
serial = "/dev/ttyUSB1"
"#,
        )
        .unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.port.serial.as_deref(), Some("/dev/ttyUSB1"));
    }

    #[test]
    fn test_load_from_path_invalid_toml_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "invalid toml [[[").unwrap();

        let config = Config::load_from_path(&path);
        assert!(config.port.serial.is_none());
    }

    #[test]
    fn test_load_from_path_nonexistent() {
        let config = Config::load_from_path(Path::new("/nonexistent/path/config.toml"));
        assert!(config.port.serial.is_none());
    }

    #[test]
    fn test_global_config_path() {
        if let Some(p) = Config::global_config_path() {
            assert!(p.to_str().unwrap().contains("bootbridge"));
            assert!(p.to_str().unwrap().ends_with("config.toml"));
        }
    }
}
