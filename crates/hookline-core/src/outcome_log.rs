//! Append-only JSONL record of every advisory decision.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::advice::AdviceSource;
use crate::decision::{NoAdviceReason, OutcomeKind, Route, SuppressionReason};
use crate::delivery::DeliveryBadge;
use crate::file_lock::LockFile;
use crate::persist::ensure_parent_dir;

const LOCK_TIMEOUT: Duration = Duration::from_millis(20);
const LOCK_POLL: Duration = Duration::from_millis(1);

#[derive(Error, Debug)]
pub enum OutcomeLogError {
    #[error("outcome log lock: {0}")]
    Lock(#[from] crate::file_lock::LockError),

    #[error("outcome log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("outcome log JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One decision as recorded on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub ts_ms: u64,
    pub trace_id: String,
    pub tool: String,
    pub route: Route,
    pub outcome: OutcomeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub badge: Option<DeliveryBadge>,
    pub latency_ms: u64,
    pub budget_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppression_reason: Option<SuppressionReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_advice_reason: Option<NoAdviceReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insight_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<AdviceSource>,
}

/// Handle to `advisory/outcomes.jsonl`.
#[derive(Debug, Clone)]
pub struct OutcomeLog {
    path: PathBuf,
    lock_path: PathBuf,
}

impl OutcomeLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, OutcomeLogError> {
        let path = path.into();
        ensure_parent_dir(&path)?;
        Ok(Self {
            lock_path: path.with_extension("lock"),
            path,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a single line.
    pub fn append(&self, record: &OutcomeRecord) -> Result<(), OutcomeLogError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let _lock = LockFile::acquire_with_wait(&self.lock_path, LOCK_TIMEOUT, LOCK_POLL)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        Ok(())
    }

    /// All readable records, oldest first. Malformed lines are skipped.
    pub fn read_all(&self) -> Result<Vec<OutcomeRecord>, OutcomeLogError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(record) = serde_json::from_str::<OutcomeRecord>(&line) {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(trace: &str) -> OutcomeRecord {
        OutcomeRecord {
            ts_ms: 1,
            trace_id: trace.into(),
            tool: "Bash".into(),
            route: Route::Quick,
            outcome: OutcomeKind::Emitted,
            badge: Some(DeliveryBadge::Fallback),
            latency_ms: 3,
            budget_ms: 3_000,
            suppression_reason: None,
            no_advice_reason: None,
            insight_key: Some("quick:Bash".into()),
            source: Some(AdviceSource::Quick),
        }
    }

    #[test]
    fn append_and_read_back() {
        let dir = tempdir().unwrap();
        let log = OutcomeLog::open(dir.path().join("advisory/outcomes.jsonl")).unwrap();
        log.append(&record("a")).unwrap();
        log.append(&record("b")).unwrap();
        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].trace_id, "b");

        let raw = std::fs::read_to_string(log.path()).unwrap();
        assert!(raw.contains("\"route\":\"quick\""));
        assert!(!raw.contains("suppression_reason"));
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempdir().unwrap();
        let log = OutcomeLog::open(dir.path().join("outcomes.jsonl")).unwrap();
        log.append(&record("a")).unwrap();
        crate::persist::append_line(log.path(), b"{broken").unwrap();
        log.append(&record("c")).unwrap();
        assert_eq!(log.read_all().unwrap().len(), 2);
    }
}
