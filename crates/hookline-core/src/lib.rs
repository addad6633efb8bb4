//! hookline-core: durable event queue and advisory decision engine for
//! coding-assistant hooks.
//!
//! # Architecture
//!
//! ```text
//! hook process ──append──► EventLog (segments/*.jsonl)
//!        │  lock timeout        ▲
//!        └──► OverflowShards ───┘ merge_pending
//!                               │
//!                        QueueConsumer ──► BatchHandler
//!                               │
//!                        checkpoint + heartbeat
//!
//! pre-tool hook ──► AdvisoryEngine ──► packet │ live │ quick
//!                        │
//!                 AdvisoryStateStore (cooldowns, fallback guard)
//!                        │
//!                   OutcomeLog (advisory/outcomes.jsonl)
//! ```
//!
//! # Modules
//!
//! - `event`: Event record and JSONL line codec
//! - `event_log`: Segmented append-only log with bounded-wait writes
//! - `overflow`: Side shards for contended writes and their merge
//! - `queue_consumer`: Checkpointed batch consumer and async loop
//! - `heartbeat`: Consumer liveness file and staleness check
//! - `advisory_engine`: Budget-aware advice routing
//! - `advisory_state`: Persisted cooldowns and fallback window
//! - `advice`: Candidates, actionability, quick advice
//! - `retrieval`: Live retrieval and packet lookup seams
//! - `delivery`: Delivery badge classification
//! - `outcome_log`: Per-decision JSONL records
//! - `config`: Configuration management
//! - `logging`: Structured logging setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod advice;
pub mod advisory_engine;
pub mod advisory_state;
pub mod config;
pub mod decision;
pub mod delivery;
pub mod error;
pub mod event;
pub mod event_log;
pub mod file_lock;
pub mod heartbeat;
pub mod logging;
pub mod outcome_log;
pub mod overflow;
pub mod persist;
pub mod queue_consumer;
pub mod retrieval;
pub mod ring_buffer;

pub use error::{Error, QueueError, Result};

/// Version of the hookline-core library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
