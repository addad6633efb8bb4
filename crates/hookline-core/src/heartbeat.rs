//! Consumer liveness heartbeat.
//!
//! The consumer rewrites `consumer.heartbeat.json` atomically once per cycle.
//! External monitors read it back with [`check_liveness`] and classify the
//! consumer by heartbeat age: within `stale_ms` is healthy, within twice
//! that is degraded, anything older is critical.

use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::event_log::LogOffset;
use crate::persist::{self, JsonFile};

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Heartbeat age beyond which the consumer is considered degraded.
    pub stale_ms: u64,
    /// fsync each heartbeat write.
    pub durable: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            stale_ms: 30_000,
            durable: false,
        }
    }
}

/// One persisted heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub component: String,
    pub pid: u32,
    pub ts_ms: u64,
    /// Human-readable timestamp (RFC 3339).
    pub ts: String,
    pub cycle: u64,
    /// Events handed downstream in the most recent cycle.
    pub last_batch: usize,
    /// Records left unread after the most recent poll (lower bound).
    pub backlog_hint: u64,
    pub checkpoint: LogOffset,
    pub quarantined_total: u64,
}

/// Liveness classification, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
    /// No readable heartbeat.
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Critical => write!(f, "critical"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Result of a liveness check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessReport {
    pub status: HealthStatus,
    pub age_ms: Option<u64>,
    pub heartbeat: Option<HeartbeatRecord>,
    pub detail: Option<String>,
}

/// Writes heartbeats for one component.
#[derive(Debug, Clone)]
pub struct HeartbeatWriter {
    path: PathBuf,
    component: String,
    durable: bool,
}

impl HeartbeatWriter {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, component: impl Into<String>, config: &HeartbeatConfig) -> Self {
        Self {
            path: path.into(),
            component: component.into(),
            durable: config.durable,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist a heartbeat stamped with the current time.
    pub fn beat(
        &self,
        cycle: u64,
        last_batch: usize,
        backlog_hint: u64,
        checkpoint: &LogOffset,
        quarantined_total: u64,
    ) -> std::io::Result<HeartbeatRecord> {
        let record = HeartbeatRecord {
            component: self.component.clone(),
            pid: std::process::id(),
            ts_ms: persist::epoch_ms_now(),
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            cycle,
            last_batch,
            backlog_hint,
            checkpoint: checkpoint.clone(),
            quarantined_total,
        };
        persist::write_json_atomic(&self.path, &record, self.durable)?;
        debug!(component = %self.component, cycle, last_batch, "Heartbeat written");
        Ok(record)
    }
}

/// Read the heartbeat file, distinguishing missing from corrupt.
pub fn read_heartbeat(path: &Path) -> std::io::Result<JsonFile<HeartbeatRecord>> {
    persist::read_json(path)
}

/// Classify liveness from the heartbeat at `path` as of `now_ms`.
#[must_use]
pub fn check_liveness(path: &Path, config: &HeartbeatConfig, now_ms: u64) -> LivenessReport {
    let record = match read_heartbeat(path) {
        Ok(JsonFile::Loaded(record)) => record,
        Ok(JsonFile::Missing) => {
            return LivenessReport {
                status: HealthStatus::Unknown,
                age_ms: None,
                heartbeat: None,
                detail: Some("no heartbeat recorded".to_string()),
            };
        }
        Ok(JsonFile::Corrupt(reason)) => {
            return LivenessReport {
                status: HealthStatus::Unknown,
                age_ms: None,
                heartbeat: None,
                detail: Some(format!("unreadable heartbeat: {reason}")),
            };
        }
        Err(err) => {
            return LivenessReport {
                status: HealthStatus::Unknown,
                age_ms: None,
                heartbeat: None,
                detail: Some(err.to_string()),
            };
        }
    };

    let age_ms = now_ms.saturating_sub(record.ts_ms);
    let status = if age_ms <= config.stale_ms {
        HealthStatus::Healthy
    } else if age_ms <= config.stale_ms.saturating_mul(2) {
        HealthStatus::Degraded
    } else {
        HealthStatus::Critical
    };

    LivenessReport {
        status,
        age_ms: Some(age_ms),
        heartbeat: Some(record),
        detail: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_heartbeat_is_unknown() {
        let dir = tempdir().unwrap();
        let report = check_liveness(
            &dir.path().join("consumer.heartbeat.json"),
            &HeartbeatConfig::default(),
            1_000,
        );
        assert_eq!(report.status, HealthStatus::Unknown);
    }

    #[test]
    fn status_follows_heartbeat_age() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("consumer.heartbeat.json");
        let config = HeartbeatConfig {
            stale_ms: 1_000,
            durable: false,
        };
        let writer = HeartbeatWriter::new(&path, "queue_consumer", &config);
        let record = writer.beat(7, 12, 0, &LogOffset::new(0, 512), 1).unwrap();
        assert_eq!(record.cycle, 7);

        let at = |delta| check_liveness(&path, &config, record.ts_ms + delta).status;
        assert_eq!(at(500), HealthStatus::Healthy);
        assert_eq!(at(1_500), HealthStatus::Degraded);
        assert_eq!(at(5_000), HealthStatus::Critical);

        let report = check_liveness(&path, &config, record.ts_ms);
        assert_eq!(report.heartbeat.unwrap().checkpoint, LogOffset::new(0, 512));
    }

    #[test]
    fn corrupt_heartbeat_is_unknown_with_detail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("consumer.heartbeat.json");
        std::fs::write(&path, b"{]").unwrap();
        let report = check_liveness(&path, &HeartbeatConfig::default(), 0);
        assert_eq!(report.status, HealthStatus::Unknown);
        assert!(report.detail.unwrap().contains("unreadable"));
    }
}
