//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/tlog/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/tlog/` (~/.config/tlog/)
//! - Data: `$XDG_DATA_HOME/tlog/` (~/.local/share/tlog/)
//! - State/Logs: `$XDG_STATE_HOME/tlog/` (~/.local/state/tlog/)

use crate::error::{Error, Result};
use crate::types::DeviceType;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Lower bound for `tracking.session_timeout_ms` (30 seconds)
pub const MIN_SESSION_TIMEOUT_MS: u64 = 30_000;

/// Upper bound for `tracking.session_timeout_ms` (24 hours)
pub const MAX_SESSION_TIMEOUT_MS: u64 = 86_400_000;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Project identity (scopes storage keys and the cross-tab channel)
    #[serde(default)]
    pub project: ProjectConfig,

    /// Collection endpoint configuration
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Queue and session tuning
    #[serde(default)]
    pub tracking: TrackingConfig,

    /// Storage area limits
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Project identity
#[derive(Debug, Deserialize, Clone)]
pub struct ProjectConfig {
    /// Project id, used in every `tlog:{id}:*` key
    #[serde(default = "default_project_id")]
    pub id: String,

    /// Device class reported in every payload
    #[serde(default)]
    pub device: DeviceType,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            id: default_project_id(),
            device: DeviceType::default(),
        }
    }
}

fn default_project_id() -> String {
    "default".to_string()
}

/// Collection endpoint configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CollectorConfig {
    /// Endpoint that receives event batches (e.g., `https://collect.example.com/events`)
    pub endpoint: Option<String>,

    /// Optional bearer token
    pub api_key: Option<String>,

    /// Request timeout in seconds for async sends
    #[serde(default = "default_collector_timeout")]
    pub timeout_secs: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout_secs: default_collector_timeout(),
        }
    }
}

fn default_collector_timeout() -> u64 {
    10
}

/// Queue and session tuning
#[derive(Debug, Deserialize, Clone)]
pub struct TrackingConfig {
    /// Fraction of non-boundary events kept (0, 1]
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: f64,

    /// Inactivity window before a session ends, in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Per-name cap for custom events in any 60s window
    #[serde(default = "default_max_same_event_per_minute")]
    pub max_same_event_per_minute: usize,

    /// Surface validation failures as errors instead of dropping silently
    #[serde(default)]
    pub qa_mode: bool,

    /// Attached to every outgoing payload
    #[serde(default)]
    pub global_metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            sampling_rate: default_sampling_rate(),
            session_timeout_ms: default_session_timeout_ms(),
            max_same_event_per_minute: default_max_same_event_per_minute(),
            qa_mode: false,
            global_metadata: None,
        }
    }
}

fn default_sampling_rate() -> f64 {
    1.0
}

fn default_session_timeout_ms() -> u64 {
    15 * 60 * 1000
}

fn default_max_same_event_per_minute() -> usize {
    60
}

/// Storage area limits
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Byte budget of the durable area (keys + values)
    #[serde(default = "default_quota_bytes")]
    pub quota_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            quota_bytes: default_quota_bytes(),
        }
    }
}

fn default_quota_bytes() -> u64 {
    5 * 1024 * 1024
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,

    /// Mirror log output to stderr
    #[serde(default)]
    pub stderr: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
            stderr: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate value ranges, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.project.id.trim().is_empty() {
            return Err(Error::Config("project.id must not be empty".to_string()));
        }

        let rate = self.tracking.sampling_rate;
        if !(rate > 0.0 && rate <= 1.0) {
            return Err(Error::Config(
                "tracking.sampling_rate must be in (0, 1]".to_string(),
            ));
        }

        let timeout = self.tracking.session_timeout_ms;
        if !(MIN_SESSION_TIMEOUT_MS..=MAX_SESSION_TIMEOUT_MS).contains(&timeout) {
            return Err(Error::Config(format!(
                "tracking.session_timeout_ms must be between {} and {}",
                MIN_SESSION_TIMEOUT_MS, MAX_SESSION_TIMEOUT_MS
            )));
        }

        let level = self.logging.level.to_ascii_lowercase();
        if !matches!(
            level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error" | "off"
        ) {
            return Err(Error::Config(format!(
                "logging.level must be one of trace, debug, info, warn, error, off (got {:?})",
                self.logging.level
            )));
        }

        if self.tracking.max_same_event_per_minute == 0 {
            return Err(Error::Config(
                "tracking.max_same_event_per_minute must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/tlog/config.toml` (~/.config/tlog/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("tlog").join("config.toml")
    }

    /// Returns the data directory path (for the durable storage database)
    ///
    /// `$XDG_DATA_HOME/tlog/` (~/.local/share/tlog/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("tlog")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/tlog/` (~/.local/state/tlog/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("tlog")
    }

    /// Returns the durable storage database path
    ///
    /// `$XDG_DATA_HOME/tlog/storage.db`
    pub fn storage_path() -> PathBuf {
        Self::data_dir().join("storage.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.project.id, "default");
        assert_eq!(config.tracking.sampling_rate, 1.0);
        assert_eq!(config.tracking.session_timeout_ms, 900_000);
        assert_eq!(config.tracking.max_same_event_per_minute, 60);
        assert_eq!(config.collector.timeout_secs, 10);
        assert!(config.collector.endpoint.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[project]
id = "shop"
device = "mobile"

[collector]
endpoint = "https://collect.example.com/events"

[tracking]
sampling_rate = 0.5
session_timeout_ms = 60000
global_metadata = { plan = "pro" }

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.project.id, "shop");
        assert_eq!(config.project.device, DeviceType::Mobile);
        assert_eq!(
            config.collector.endpoint.as_deref(),
            Some("https://collect.example.com/events")
        );
        assert_eq!(config.tracking.sampling_rate, 0.5);
        assert_eq!(config.tracking.session_timeout_ms, 60_000);
        let metadata = config.tracking.global_metadata.as_ref().unwrap();
        assert_eq!(metadata["plan"], "pro");
        assert_eq!(config.logging.level, "debug");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_ranges() {
        let mut config = Config::default();
        config.tracking.sampling_rate = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tracking.session_timeout_ms = 1_000;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.project.id = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
        config.logging.level = "DEBUG".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[tracking]\nsampling_rate = 2.0\n").unwrap();
        assert!(matches!(Config::load_from(&path), Err(Error::Config(_))));

        std::fs::write(&path, "[project]\nid = \"blog\"\n").unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.project.id, "blog");
    }
}
