//! Captured tool-usage events and their on-disk line encoding.
//!
//! An [`Event`] is produced once by a hook process, stamped with its arrival
//! time and a unique id, and never mutated afterwards. On disk each event is
//! one JSON object terminated by `\n`; a line without its terminator is a
//! partial write and is never decoded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::QueueError;
use crate::persist::epoch_ms_now;

/// Schema tag written into every encoded event.
pub const EVENT_SCHEMA_VERSION: &str = "hookline.event.v1";

static EVENT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Hook lifecycle point that produced the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStart,
    UserPrompt,
    PreTool,
    PostTool,
    PostToolFailure,
    Stop,
    SessionEnd,
    Custom,
}

/// Per-record merge marker carried by events folded in from an overflow shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOrigin {
    /// Sealed shard file name the record came from.
    pub shard: String,
    /// Position of the record in the shard's arrival-time order.
    pub index: u64,
}

/// An immutable captured event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default = "default_schema")]
    pub schema: String,
    /// Unique id (32 hex chars).
    pub event_id: String,
    /// Arrival time in epoch milliseconds.
    pub ts_ms: u64,
    /// Producer identity (hook name, adapter name).
    pub source: String,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<MergeOrigin>,
}

fn default_schema() -> String {
    EVENT_SCHEMA_VERSION.to_string()
}

impl Event {
    /// Create an event stamped with the current time and a fresh id.
    #[must_use]
    pub fn new(source: impl Into<String>, kind: EventKind, payload: serde_json::Value) -> Self {
        let source = source.into();
        let event_id = generate_event_id(&source, &payload);
        Self {
            schema: default_schema(),
            event_id,
            ts_ms: epoch_ms_now(),
            source,
            kind,
            session_id: None,
            trace_id: None,
            tool_name: None,
            payload,
            origin: None,
        }
    }

    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    #[must_use]
    pub fn with_tool_name(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    /// Override the arrival timestamp (replay and test fixtures).
    #[must_use]
    pub fn with_ts_ms(mut self, ts_ms: u64) -> Self {
        self.ts_ms = ts_ms;
        self
    }
}

/// Generate a unique event id.
///
/// `sha256("{pid}|{nanos}|{counter}|{nonce}|{source}|{payload}")`, first 16
/// bytes hex-encoded. The pid, process-local counter, and random nonce keep
/// ids distinct across concurrent producer processes.
#[must_use]
pub fn generate_event_id(source: &str, payload: &serde_json::Value) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    let counter = EVENT_COUNTER.fetch_add(1, Ordering::Relaxed);
    let nonce: u64 = rand::random();

    let mut hasher = Sha256::new();
    hasher.update(
        format!(
            "{}|{nanos}|{counter}|{nonce}|{source}|",
            std::process::id()
        )
        .as_bytes(),
    );
    hasher.update(payload.to_string().as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Encode an event as one `\n`-terminated JSON line.
pub fn encode_line(event: &Event) -> Result<Vec<u8>, QueueError> {
    let mut line = serde_json::to_vec(event)?;
    if line.contains(&b'\n') {
        return Err(QueueError::InvalidRecord {
            message: "encoded record contains a raw newline".to_string(),
        });
    }
    line.push(b'\n');
    Ok(line)
}

/// Decode one stored line (with or without its trailing newline).
pub fn decode_line(line: &[u8]) -> Result<Event, QueueError> {
    let trimmed = trim_line(line);
    if trimmed.is_empty() {
        return Err(QueueError::MalformedRecord {
            location: "line".to_string(),
            reason: "empty line".to_string(),
        });
    }
    serde_json::from_slice::<Event>(trimmed).map_err(|err| QueueError::MalformedRecord {
        location: "line".to_string(),
        reason: err.to_string(),
    })
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &line[..end]
}
