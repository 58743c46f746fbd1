//! Configuration management for the Mirrorwall receiver.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/mirrorwall/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("port must be between 1 and 65535, got {0}")]
    InvalidPort(u16),

    #[error("max_feeds must be between 1 and 64, got {0}")]
    InvalidMaxFeeds(usize),

    #[error("idle_timeout_secs must be between 1 and 3600 seconds, got {0}")]
    InvalidIdleTimeout(u64),

    #[error("pairing_pin must be 4 to 8 digits")]
    InvalidPairingPin,

    #[error("display_name must not be empty")]
    EmptyDisplayName,

    #[error("max_request_size must be at least 1024 bytes, got {0}")]
    InvalidMaxRequestSize(usize),

    #[error("grid must be at least 1x1, got {0}x{1}")]
    InvalidGrid(usize, usize),

    #[error("poll_interval_ms must be between 10 and 10000, got {0}")]
    InvalidPollInterval(u64),

    #[error("external_binary must not be empty")]
    EmptyExternalBinary,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Mirrorwall receiver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Mirroring protocol listener and pairing.
    pub receiver: ReceiverConfig,

    /// Stream registry sizing.
    pub registry: RegistryConfig,

    /// Mirroring backend selection.
    pub backend: BackendConfig,

    /// Viewer grid and polling cadence.
    pub viewer: ViewerConfig,

    /// Logging output.
    pub logging: LoggingConfig,
}

/// What to do when a single frame cannot be decoded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DecodeFailurePolicy {
    /// Log the failure, keep the last good frame and carry on.
    #[default]
    Skip,
    /// Fail the session.
    Abort,
}

/// Mirroring protocol configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReceiverConfig {
    /// TCP port of the mirroring protocol.
    pub port: u16,

    /// Name advertised to devices.
    pub display_name: String,

    /// PIN devices enter during pair-setup.
    pub pairing_pin: String,

    /// Seconds without a decrypted frame before a streaming session is
    /// torn down.
    pub idle_timeout_secs: u64,

    /// Handling of undecodable frames.
    pub decode_failure_policy: DecodeFailurePolicy,

    /// Directory holding the receiver identity and paired devices.
    pub data_dir: PathBuf,

    /// Largest accepted request (headers plus body) in bytes.
    pub max_request_size: usize,
}

/// Stream registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Maximum concurrent feeds, shared by every transport.
    pub max_feeds: usize,
}

/// Mirroring backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    /// Use the external mirroring binary when it is installed.
    pub prefer_external: bool,

    /// Name or path of the external binary.
    pub external_binary: String,

    /// Extra arguments passed to the external binary.
    pub external_args: Vec<String>,
}

/// Viewer configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ViewerConfig {
    /// Grid rows.
    pub grid_rows: usize,

    /// Grid columns.
    pub grid_cols: usize,

    /// Snapshot polling interval in milliseconds.
    pub poll_interval_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Optional log file; rotated daily.
    pub file: Option<PathBuf>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            port: 7000,
            display_name: "Mirrorwall Receiver".to_string(),
            pairing_pin: "3939".to_string(),
            idle_timeout_secs: 30,
            decode_failure_policy: DecodeFailurePolicy::Skip,
            data_dir: default_data_dir(),
            max_request_size: 1024 * 1024, // 1MB
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { max_feeds: 8 }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            prefer_external: false,
            external_binary: "uxplay".to_string(),
            external_args: Vec::new(),
        }
    }
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            grid_rows: 2,
            grid_cols: 4,
            poll_interval_ms: 100, // 10 Hz
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl ReceiverConfig {
    /// Returns the idle timeout as a [`Duration`].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl ViewerConfig {
    /// Returns the polling interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mirrorwall")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mirrorwall")
}

/// Reads a non-empty environment variable.
fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - MIRRORWALL_PORT: Override the listening port
    /// - MIRRORWALL_DISPLAY_NAME: Override the advertised name
    /// - MIRRORWALL_PIN: Override the pairing PIN
    /// - MIRRORWALL_MAX_FEEDS: Override registry capacity
    /// - MIRRORWALL_IDLE_TIMEOUT: Override the idle timeout in seconds
    /// - MIRRORWALL_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    ///
    /// Numeric variables that fail to parse are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        if let Some(port) = env_override("MIRRORWALL_PORT") {
            match port.parse() {
                Ok(port) => {
                    tracing::info!("Overriding port from environment: {}", port);
                    self.receiver.port = port;
                }
                Err(_) => tracing::warn!("Ignoring invalid MIRRORWALL_PORT: {}", port),
            }
        }

        if let Some(name) = env_override("MIRRORWALL_DISPLAY_NAME") {
            tracing::info!("Overriding display_name from environment: {}", name);
            self.receiver.display_name = name;
        }

        if let Some(pin) = env_override("MIRRORWALL_PIN") {
            tracing::info!("Overriding pairing_pin from environment");
            self.receiver.pairing_pin = pin;
        }

        if let Some(max) = env_override("MIRRORWALL_MAX_FEEDS") {
            match max.parse() {
                Ok(max) => {
                    tracing::info!("Overriding max_feeds from environment: {}", max);
                    self.registry.max_feeds = max;
                }
                Err(_) => tracing::warn!("Ignoring invalid MIRRORWALL_MAX_FEEDS: {}", max),
            }
        }

        if let Some(secs) = env_override("MIRRORWALL_IDLE_TIMEOUT") {
            match secs.parse() {
                Ok(secs) => {
                    tracing::info!("Overriding idle_timeout_secs from environment: {}", secs);
                    self.receiver.idle_timeout_secs = secs;
                }
                Err(_) => tracing::warn!("Ignoring invalid MIRRORWALL_IDLE_TIMEOUT: {}", secs),
            }
        }

        if let Some(level) = env_override("MIRRORWALL_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.logging.level = level;
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.receiver.port == 0 {
            return Err(ConfigError::InvalidPort(self.receiver.port));
        }

        if self.registry.max_feeds < 1 || self.registry.max_feeds > 64 {
            return Err(ConfigError::InvalidMaxFeeds(self.registry.max_feeds));
        }

        if self.receiver.idle_timeout_secs < 1 || self.receiver.idle_timeout_secs > 3600 {
            return Err(ConfigError::InvalidIdleTimeout(
                self.receiver.idle_timeout_secs,
            ));
        }

        let pin = &self.receiver.pairing_pin;
        if !(4..=8).contains(&pin.len()) || !pin.chars().all(|c| c.is_ascii_digit()) {
            return Err(ConfigError::InvalidPairingPin);
        }

        if self.receiver.display_name.trim().is_empty() {
            return Err(ConfigError::EmptyDisplayName);
        }

        if self.receiver.max_request_size < 1024 {
            return Err(ConfigError::InvalidMaxRequestSize(
                self.receiver.max_request_size,
            ));
        }

        if self.viewer.grid_rows < 1 || self.viewer.grid_cols < 1 {
            return Err(ConfigError::InvalidGrid(
                self.viewer.grid_rows,
                self.viewer.grid_cols,
            ));
        }

        if self.viewer.poll_interval_ms < 10 || self.viewer.poll_interval_ms > 10_000 {
            return Err(ConfigError::InvalidPollInterval(
                self.viewer.poll_interval_ms,
            ));
        }

        if self.backend.external_binary.trim().is_empty() {
            return Err(ConfigError::EmptyExternalBinary);
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    const ENV_VARS: &[&str] = &[
        "MIRRORWALL_PORT",
        "MIRRORWALL_DISPLAY_NAME",
        "MIRRORWALL_PIN",
        "MIRRORWALL_MAX_FEEDS",
        "MIRRORWALL_IDLE_TIMEOUT",
        "MIRRORWALL_LOG_LEVEL",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.receiver.port, 7000);
        assert_eq!(config.receiver.display_name, "Mirrorwall Receiver");
        assert_eq!(config.receiver.pairing_pin, "3939");
        assert_eq!(config.receiver.idle_timeout(), Duration::from_secs(30));
        assert_eq!(
            config.receiver.decode_failure_policy,
            DecodeFailurePolicy::Skip
        );
        assert_eq!(config.registry.max_feeds, 8);
        assert!(!config.backend.prefer_external);
        assert_eq!(config.backend.external_binary, "uxplay");
        assert_eq!(config.viewer.grid_rows * config.viewer.grid_cols, 8);
        assert_eq!(config.viewer.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.file.is_none());
    }

    #[test]
    fn test_default_data_dir() {
        let config = ReceiverConfig::default();
        assert!(config.data_dir.to_string_lossy().contains("mirrorwall"));
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
            [receiver]
            port = 7100
            decode_failure_policy = "abort"

            [registry]
            max_feeds = 4
        "#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.receiver.port, 7100);
        assert_eq!(
            config.receiver.decode_failure_policy,
            DecodeFailurePolicy::Abort
        );
        assert_eq!(config.registry.max_feeds, 4);
        // Unspecified values keep their defaults
        assert_eq!(config.receiver.pairing_pin, "3939");
        assert_eq!(config.viewer.grid_cols, 4);
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
            [receiver]
            port = 7001
            display_name = "Lobby Wall"
            pairing_pin = "123456"
            idle_timeout_secs = 10
            decode_failure_policy = "skip"
            data_dir = "/var/lib/mirrorwall"
            max_request_size = 65536

            [registry]
            max_feeds = 16

            [backend]
            prefer_external = true
            external_binary = "/usr/bin/uxplay"
            external_args = ["-n", "Lobby"]

            [viewer]
            grid_rows = 4
            grid_cols = 4
            poll_interval_ms = 50

            [logging]
            level = "debug"
            file = "/var/log/mirrorwall.log"
        "#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.receiver.display_name, "Lobby Wall");
        assert_eq!(config.receiver.data_dir, PathBuf::from("/var/lib/mirrorwall"));
        assert_eq!(config.registry.max_feeds, 16);
        assert!(config.backend.prefer_external);
        assert_eq!(config.backend.external_args, vec!["-n", "Lobby"]);
        assert_eq!(config.viewer.poll_interval_ms, 50);
        assert_eq!(
            config.logging.file,
            Some(PathBuf::from("/var/log/mirrorwall.log"))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[receiver\nport = 1");
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid TOML configuration"));
    }

    #[test]
    fn test_from_toml_unknown_policy() {
        let toml = r#"
            [receiver]
            decode_failure_policy = "retry"
        "#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip() {
        let mut config = Config::default();
        config.receiver.display_name = "Studio".to_string();
        config.backend.external_args = vec!["-p".to_string()];

        let parsed = Config::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load(temp_dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_creates_directories() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("dir").join("config.toml");

        let mut config = Config::default();
        config.registry.max_feeds = 3;
        config.save(&path).unwrap();

        assert!(path.exists());
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "not = [valid").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("mirrorwall/config.toml"));
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let toml = r#"
            [receiver]
            port = 7002
            airplay_version = 2

            [network]
            log_level = "info"
        "#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.receiver.port, 7002);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var("MIRRORWALL_PORT", "7200");
        std::env::set_var("MIRRORWALL_DISPLAY_NAME", "Board Room");
        std::env::set_var("MIRRORWALL_PIN", "2468");
        std::env::set_var("MIRRORWALL_MAX_FEEDS", "2");
        std::env::set_var("MIRRORWALL_IDLE_TIMEOUT", "5");
        std::env::set_var("MIRRORWALL_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.receiver.port, 7200);
        assert_eq!(config.receiver.display_name, "Board Room");
        assert_eq!(config.receiver.pairing_pin, "2468");
        assert_eq!(config.registry.max_feeds, 2);
        assert_eq!(config.receiver.idle_timeout_secs, 5);
        assert_eq!(config.logging.level, "debug");

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        clear_env();
        std::env::set_var("MIRRORWALL_DISPLAY_NAME", "");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.receiver.display_name, "Mirrorwall Receiver");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_invalid_number_ignored() {
        clear_env();
        std::env::set_var("MIRRORWALL_PORT", "seven-thousand");
        std::env::set_var("MIRRORWALL_MAX_FEEDS", "-1");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.receiver.port, 7000);
        assert_eq!(config.registry.max_feeds, 8);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_unset_does_not_override() {
        clear_env();
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_validate_default_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_port_zero() {
        let mut config = Config::default();
        config.receiver.port = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPort(0)));
    }

    #[test]
    fn test_validate_max_feeds() {
        let mut config = Config::default();
        config.registry.max_feeds = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxFeeds(0)));

        config.registry.max_feeds = 65;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxFeeds(65)));

        config.registry.max_feeds = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_idle_timeout_zero() {
        let mut config = Config::default();
        config.receiver.idle_timeout_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidIdleTimeout(0)));
    }

    #[test]
    fn test_validate_pairing_pin() {
        let mut config = Config::default();
        for bad in ["", "123", "12a4", "123456789", "39 39"] {
            config.receiver.pairing_pin = bad.to_string();
            assert_eq!(config.validate(), Err(ConfigError::InvalidPairingPin), "{bad:?}");
        }

        config.receiver.pairing_pin = "00000000".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_empty_display_name() {
        let mut config = Config::default();
        config.receiver.display_name = "   ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::EmptyDisplayName));
    }

    #[test]
    fn test_validate_grid() {
        let mut config = Config::default();
        config.viewer.grid_cols = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidGrid(2, 0)));
    }

    #[test]
    fn test_validate_poll_interval() {
        let mut config = Config::default();
        config.viewer.poll_interval_ms = 5;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPollInterval(5)));
    }

    #[test]
    fn test_validate_max_request_size() {
        let mut config = Config::default();
        config.receiver.max_request_size = 100;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidMaxRequestSize(100))
        );
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );

        config.logging.level = "WARN".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_empty_external_binary() {
        let mut config = Config::default();
        config.backend.external_binary = String::new();
        assert_eq!(config.validate(), Err(ConfigError::EmptyExternalBinary));
    }
}
