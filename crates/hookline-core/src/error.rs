//! Error types for hookline-core

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event_log::LogOffset;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for hookline-core
#[derive(Error, Debug)]
pub enum Error {
    /// Event queue errors
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Logging setup errors
    #[error("Logging error: {0}")]
    Logging(#[from] crate::logging::LogError),

    /// Outcome log errors
    #[error("Outcome log error: {0}")]
    OutcomeLog(#[from] crate::outcome_log::OutcomeLogError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Stable classification for queue errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueErrorClass {
    /// Transient; the same call may succeed later.
    Retryable,
    /// Both write paths are contended; a health signal, not a crash.
    Overload,
    /// The input itself is unacceptable.
    TerminalData,
    /// Persisted bytes are damaged.
    Corruption,
}

/// Event queue errors (log store, overflow shards, consumer).
#[derive(Error, Debug)]
pub enum QueueError {
    /// Exclusive access to a log tail was not obtained in time.
    #[error("write lock {path} not acquired within {waited_ms}ms")]
    WriteTimeout { path: String, waited_ms: u64 },

    /// Both the primary log and the overflow shard timed out.
    #[error(
        "event not persisted: primary lock timed out ({primary_waited_ms}ms) and overflow lock timed out ({overflow_waited_ms}ms)"
    )]
    Saturated {
        primary_waited_ms: u64,
        overflow_waited_ms: u64,
    },

    /// The record cannot be written (too large, not serializable).
    #[error("invalid record: {message}")]
    InvalidRecord { message: String },

    /// A stored line could not be decoded.
    #[error("malformed record at {location}: {reason}")]
    MalformedRecord { location: String, reason: String },

    /// A checkpoint would move the consumer head backwards.
    #[error("checkpoint regression: current={current}, attempted={attempted}")]
    CheckpointRegression {
        current: LogOffset,
        attempted: LogOffset,
    },

    /// Another consumer already owns this queue directory.
    #[error("queue consumer already running (lock held: {path})")]
    ConsumerBusy { path: String },

    /// The downstream batch handler rejected a batch.
    #[error("batch handler failed: {message}")]
    Handler { message: String },

    /// A consumer cycle panicked on the blocking pool.
    #[error("consumer cycle aborted: {message}")]
    CycleAborted { message: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueueError {
    /// Stable error-class mapping for retry and health decisions.
    #[must_use]
    pub fn class(&self) -> QueueErrorClass {
        match self {
            Self::WriteTimeout { .. }
            | Self::Io(_)
            | Self::ConsumerBusy { .. }
            | Self::Handler { .. } => QueueErrorClass::Retryable,
            Self::Saturated { .. } => QueueErrorClass::Overload,
            Self::InvalidRecord { .. }
            | Self::CheckpointRegression { .. }
            | Self::Json(_) => QueueErrorClass::TerminalData,
            Self::MalformedRecord { .. } => QueueErrorClass::Corruption,
            Self::CycleAborted { .. } => QueueErrorClass::Retryable,
        }
    }
}

impl From<crate::file_lock::LockError> for QueueError {
    fn from(err: crate::file_lock::LockError) -> Self {
        match err {
            crate::file_lock::LockError::Timeout { path, waited_ms } => {
                Self::WriteTimeout { path, waited_ms }
            }
            crate::file_lock::LockError::Io(io) => Self::Io(io),
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for the schema
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range or inconsistent
    #[error("invalid config: {0}")]
    Invalid(String),
}
