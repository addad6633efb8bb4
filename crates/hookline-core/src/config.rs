//! Configuration management for hookline
//!
//! Handles loading and validation of `hookline.toml`. Every section is
//! optional; missing keys fall back to the defaults of the owning module.
//!
//! ```toml
//! [general]
//! data_dir = "~/.local/share/hookline"
//!
//! [general.log]
//! level = "info"
//! format = "json"
//!
//! [queue]
//! lock_timeout_ms = 50
//!
//! [advisory]
//! quick_fallback_min_remaining_ms = 900
//! fallback_guard_max_ratio = 0.55
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::advisory_engine::AdvisoryConfig;
use crate::error::ConfigError;
use crate::event_log::EventLogConfig;
use crate::heartbeat::HeartbeatConfig;
use crate::logging::LogConfig;
use crate::overflow::OverflowConfig;
use crate::queue_consumer::ConsumerConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Primary event log settings
    pub queue: EventLogConfig,

    /// Overflow shard settings
    pub overflow: OverflowConfig,

    /// Queue consumer settings
    pub consumer: ConsumerConfig,

    /// Consumer heartbeat settings
    pub heartbeat: HeartbeatConfig,

    /// Advisory decision engine settings
    pub advisory: AdvisoryConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Root directory for queue and advisory state. `~` is expanded.
    pub data_dir: String,

    /// Logging settings
    pub log: LogConfig,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log: LogConfig::default(),
        }
    }
}

fn default_data_dir() -> String {
    "~/.local/share/hookline".to_string()
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output for interactive use
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "unknown log format: {s}. Expected one of: pretty, json"
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

/// Resolved on-disk locations under the data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    pub data_dir: PathBuf,
    /// Directory handed to `EventLog::open`.
    pub queue_dir: PathBuf,
    pub heartbeat: PathBuf,
    pub advisory_state: PathBuf,
    pub outcome_log: PathBuf,
}

impl DataPaths {
    #[must_use]
    pub fn under(data_dir: &Path) -> Self {
        let queue_dir = data_dir.join("queue");
        let advisory_dir = data_dir.join("advisory");
        Self {
            data_dir: data_dir.to_path_buf(),
            heartbeat: queue_dir.join("consumer.heartbeat.json"),
            queue_dir,
            advisory_state: advisory_dir.join("state.json"),
            outcome_log: advisory_dir.join("outcomes.jsonl"),
        }
    }
}

impl Config {
    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints every section relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.general.data_dir.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "general.data_dir must not be empty".to_string(),
            ));
        }
        self.queue
            .validate()
            .map_err(|err| ConfigError::Invalid(format!("queue: {err}")))?;
        if self.overflow.merge_chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "overflow.merge_chunk_size must be >= 1".to_string(),
            ));
        }
        if self.overflow.merge_max_events_per_pass == 0 {
            return Err(ConfigError::Invalid(
                "overflow.merge_max_events_per_pass must be >= 1".to_string(),
            ));
        }
        if self.overflow.lock_poll_ms == 0 {
            return Err(ConfigError::Invalid(
                "overflow.lock_poll_ms must be >= 1".to_string(),
            ));
        }
        if self.consumer.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "consumer.batch_size must be >= 1".to_string(),
            ));
        }
        if self.consumer.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "consumer.poll_interval_ms must be >= 1".to_string(),
            ));
        }
        if self.heartbeat.stale_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat.stale_ms must be >= 1".to_string(),
            ));
        }
        self.advisory.validate()
    }

    /// Data directory with `~` expanded.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        expand_tilde(&self.general.data_dir)
    }

    #[must_use]
    pub fn paths(&self) -> DataPaths {
        DataPaths::under(&self.data_dir())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(path));
    }
    if let Some(suffix) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(suffix);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.general.log.level, "info");
        assert_eq!(config.queue.lock_timeout_ms, 50);
        assert_eq!(config.consumer.batch_size, 256);
        assert_eq!(config.advisory.quick_fallback_min_remaining_ms, 900);
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.general.data_dir, "~/.local/share/hookline");
        assert_eq!(config.overflow.merge_chunk_size, 256);
    }

    #[test]
    fn partial_sections_override_only_named_keys() {
        let config = Config::from_toml_str(
            r#"
            [general]
            data_dir = "/var/lib/hookline"

            [general.log]
            format = "json"

            [queue]
            lock_timeout_ms = 10

            [advisory]
            action_first_enabled = true
            fallback_guard_max_ratio = 0.4
            "#,
        )
        .unwrap();
        assert_eq!(config.general.log.format, LogFormat::Json);
        assert_eq!(config.general.log.level, "info");
        assert_eq!(config.queue.lock_timeout_ms, 10);
        assert_eq!(config.queue.lock_poll_ms, 2);
        assert!(config.advisory.action_first_enabled);
        assert!((config.advisory.fallback_guard_max_ratio - 0.4).abs() < f64::EPSILON);

        let paths = config.paths();
        assert_eq!(paths.queue_dir, PathBuf::from("/var/lib/hookline/queue"));
        assert_eq!(
            paths.advisory_state,
            PathBuf::from("/var/lib/hookline/advisory/state.json")
        );
        assert_eq!(
            paths.outcome_log,
            PathBuf::from("/var/lib/hookline/advisory/outcomes.jsonl")
        );
        assert_eq!(
            paths.heartbeat,
            PathBuf::from("/var/lib/hookline/queue/consumer.heartbeat.json")
        );
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let err = Config::from_toml_str("[advisory]\nfallback_guard_max_ratio = 1.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = Config::from_toml_str("[consumer]\nbatch_size = 0\n").unwrap_err();
        assert!(err.to_string().contains("batch_size"));

        let err = Config::from_toml_str("[queue]\nsegment_max_bytes = 0\n").unwrap_err();
        assert!(err.to_string().contains("queue"));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = Config::from_toml_str("[queue\nlock_timeout_ms = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_from_reads_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hookline.toml");
        std::fs::write(&path, "[heartbeat]\nstale_ms = 5000\n").unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.heartbeat.stale_ms, 5_000);

        let missing = Config::load_from(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }

    #[test]
    fn tilde_expansion() {
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
        assert_eq!(expand_tilde("rel/path"), PathBuf::from("rel/path"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~/x"), home.join("x"));
            assert_eq!(expand_tilde("~"), home);
        }
    }

    #[test]
    fn log_format_parse_and_display() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Json.to_string(), "json");
    }
}
