//! Single consumer for the event log.
//!
//! Each cycle merges pending overflow shards, reads a batch from the
//! persisted checkpoint, hands it to the downstream [`BatchHandler`], and
//! only after the handler succeeds advances the checkpoint. A crash between
//! handling and checkpointing replays the batch on restart (at-least-once),
//! which is why handlers must tolerate duplicates.
//!
//! One consumer per queue directory is enforced with a non-blocking
//! exclusive lock on `consumer.lock`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::QueueError;
use crate::event::Event;
use crate::event_log::{EventLog, LogOffset, RotationReport};
use crate::file_lock::LockFile;
use crate::heartbeat::{HeartbeatConfig, HeartbeatWriter};
use crate::overflow::MergeReport;
use crate::persist::{self, JsonFile};

/// Consumer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Max events handed to the handler per cycle.
    pub batch_size: usize,
    /// Interval between cycles in the async loop.
    pub poll_interval_ms: u64,
    /// Merge overflow shards at the start of each cycle.
    pub merge_each_cycle: bool,
    /// Rotate fully-consumed segments at the end of each cycle.
    pub rotate_each_cycle: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            poll_interval_ms: 1_000,
            merge_each_cycle: true,
            rotate_each_cycle: true,
        }
    }
}

/// Persisted consumer position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCheckpoint {
    pub offset: LogOffset,
    pub events_consumed: u64,
    pub updated_at_ms: u64,
    #[serde(default)]
    pub updated_at: String,
}

/// Outcome of a checkpoint commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointOutcome {
    Advanced,
    NoopAlreadyAdvanced,
}

/// Events available from the current checkpoint.
#[derive(Debug, Clone, Default)]
pub struct Backlog {
    pub events: Vec<Event>,
    pub start_offset: LogOffset,
    /// Checkpoint to commit once `events` are handled.
    pub next_offset: LogOffset,
    pub quarantined: u64,
}

impl Backlog {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.next_offset == self.start_offset
    }
}

/// Error returned by a downstream batch handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Downstream consumer of event batches.
///
/// Delivery is at-least-once: the same batch may be seen again after a crash
/// or a handler failure.
pub trait BatchHandler {
    fn handle(&mut self, batch: &[Event]) -> Result<(), HandlerError>;
}

impl<F> BatchHandler for F
where
    F: FnMut(&[Event]) -> Result<(), HandlerError>,
{
    fn handle(&mut self, batch: &[Event]) -> Result<(), HandlerError> {
        self(batch)
    }
}

/// Summary of one consumer cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub cycle: u64,
    pub merge: Option<MergeReport>,
    pub delivered: usize,
    pub quarantined: u64,
    pub checkpoint: LogOffset,
    pub checkpoint_outcome: Option<CheckpointOutcome>,
    pub rotation: Option<RotationReport>,
}

/// Lifetime counters for a consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerStats {
    pub cycles: u64,
    pub events_delivered: u64,
    pub events_merged: u64,
    pub handler_failures: u64,
    pub cycle_errors: u64,
    pub quarantined_total: u64,
}

/// The queue consumer. Holds `consumer.lock` for its lifetime.
#[derive(Debug)]
pub struct QueueConsumer {
    log: Arc<EventLog>,
    config: ConsumerConfig,
    checkpoint_path: PathBuf,
    checkpoint: QueueCheckpoint,
    heartbeat: HeartbeatWriter,
    stats: ConsumerStats,
    _lock: LockFile,
}

impl QueueConsumer {
    /// Open the consumer for `log`'s queue directory.
    ///
    /// Fails with `ConsumerBusy` when another consumer holds the lock. A
    /// missing or unreadable checkpoint starts from the beginning of the log.
    pub fn open(
        log: Arc<EventLog>,
        config: ConsumerConfig,
        heartbeat: &HeartbeatConfig,
    ) -> Result<Self, QueueError> {
        let lock_path = log.dir().join("consumer.lock");
        let Some(lock) = LockFile::try_acquire(&lock_path)? else {
            return Err(QueueError::ConsumerBusy {
                path: lock_path.display().to_string(),
            });
        };

        let checkpoint_path = log.dir().join("checkpoint.json");
        let checkpoint = match persist::read_json::<QueueCheckpoint>(&checkpoint_path)? {
            JsonFile::Loaded(cp) => cp,
            JsonFile::Missing => QueueCheckpoint::default(),
            JsonFile::Corrupt(reason) => {
                warn!(
                    path = %checkpoint_path.display(),
                    reason = %reason,
                    "Checkpoint unreadable; replaying from start of log"
                );
                QueueCheckpoint::default()
            }
        };
        info!(offset = %checkpoint.offset, "Queue consumer opened");

        Ok(Self {
            heartbeat: HeartbeatWriter::new(
                log.dir().join("consumer.heartbeat.json"),
                "queue_consumer",
                heartbeat,
            ),
            log,
            config,
            checkpoint_path,
            checkpoint,
            stats: ConsumerStats::default(),
            _lock: lock,
        })
    }

    #[must_use]
    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    /// Last committed checkpoint.
    #[must_use]
    pub fn checkpoint_state(&self) -> &QueueCheckpoint {
        &self.checkpoint
    }

    #[must_use]
    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    /// Read up to `batch_size` events from the committed checkpoint.
    ///
    /// Until a checkpoint is committed, repeated polls return the same batch.
    pub fn poll(&mut self) -> Result<Backlog, QueueError> {
        let start = self.checkpoint.offset.clone();
        let batch = self.log.read_from(&start, self.config.batch_size.max(1))?;
        self.stats.quarantined_total += batch.quarantined;
        Ok(Backlog {
            events: batch.records.into_iter().map(|(_, event)| event).collect(),
            start_offset: start,
            next_offset: batch.next_offset,
            quarantined: batch.quarantined,
        })
    }

    /// View of the pending backlog for downstream callers.
    pub fn backlog(&mut self) -> Result<Backlog, QueueError> {
        self.poll()
    }

    /// Commit `offset` as consumed. Monotonic; persisted before returning.
    pub fn checkpoint(&mut self, offset: LogOffset) -> Result<CheckpointOutcome, QueueError> {
        self.commit(offset, 0)
    }

    fn commit(&mut self, offset: LogOffset, delivered: u64) -> Result<CheckpointOutcome, QueueError> {
        if offset < self.checkpoint.offset {
            return Err(QueueError::CheckpointRegression {
                current: self.checkpoint.offset.clone(),
                attempted: offset,
            });
        }
        if offset == self.checkpoint.offset {
            return Ok(CheckpointOutcome::NoopAlreadyAdvanced);
        }

        let next = QueueCheckpoint {
            offset,
            events_consumed: self.checkpoint.events_consumed + delivered,
            updated_at_ms: persist::epoch_ms_now(),
            updated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        persist::write_json_atomic(&self.checkpoint_path, &next, true)?;
        debug!(offset = %next.offset, events_consumed = next.events_consumed, "Checkpoint advanced");
        self.checkpoint = next;
        Ok(CheckpointOutcome::Advanced)
    }

    /// Run one merge → poll → handle → checkpoint → rotate → heartbeat cycle.
    ///
    /// A handler failure returns `QueueError::Handler` with the checkpoint
    /// unchanged, so the same batch is offered again next cycle.
    pub fn run_cycle(&mut self, handler: &mut dyn BatchHandler) -> Result<CycleReport, QueueError> {
        self.stats.cycles += 1;
        let mut report = CycleReport {
            cycle: self.stats.cycles,
            ..CycleReport::default()
        };

        if self.config.merge_each_cycle {
            match self.log.merge_pending() {
                Ok(merge) => {
                    self.stats.events_merged += merge.events_merged as u64;
                    report.merge = Some(merge);
                }
                Err(err) => warn!(error = %err, "Overflow merge failed; will retry next cycle"),
            }
        }

        let backlog = self.poll()?;
        report.quarantined = backlog.quarantined;
        let batch_full = backlog.events.len() >= self.config.batch_size.max(1);

        if !backlog.events.is_empty() {
            if let Err(err) = handler.handle(&backlog.events) {
                self.stats.handler_failures += 1;
                warn!(
                    error = %err,
                    batch = backlog.events.len(),
                    offset = %backlog.start_offset,
                    "Batch handler failed; batch will be replayed"
                );
                self.write_heartbeat(0, batch_full);
                return Err(QueueError::Handler {
                    message: err.message,
                });
            }
        }

        if backlog.next_offset > self.checkpoint.offset {
            let delivered = backlog.events.len();
            report.checkpoint_outcome =
                Some(self.commit(backlog.next_offset.clone(), delivered as u64)?);
            report.delivered = delivered;
            self.stats.events_delivered += delivered as u64;
        }
        report.checkpoint = self.checkpoint.offset.clone();

        if self.config.rotate_each_cycle {
            match self.log.rotate(&self.checkpoint.offset) {
                Ok(rotation) => report.rotation = Some(rotation),
                Err(err) => warn!(error = %err, "Segment rotation failed"),
            }
        }

        self.write_heartbeat(report.delivered, batch_full);
        Ok(report)
    }

    /// Drive `run_cycle` on a fixed interval until `shutdown` flips to true
    /// (or its sender is dropped). Cycle errors are logged and the loop
    /// continues.
    ///
    /// Each cycle runs on the blocking pool: lock waits and fsyncs never
    /// stall a runtime worker. A shutdown that arrives mid-cycle is seen once
    /// the cycle finishes.
    pub async fn run<H>(self, handler: H, mut shutdown: watch::Receiver<bool>) -> ConsumerStats
    where
        H: BatchHandler + Send + 'static,
    {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            "Queue consumer loop started"
        );

        let mut stats = self.stats.clone();
        let mut worker = Some((self, handler));
        loop {
            if *shutdown.borrow() {
                break;
            }
            let tick = tokio::select! {
                _ = interval.tick() => true,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    false
                }
            };
            if !tick {
                continue;
            }

            let Some((consumer, handler)) = worker.take() else {
                break;
            };
            match consumer.run_cycle_blocking(handler).await {
                Ok((mut consumer, handler, result)) => {
                    if let Err(err) = result {
                        consumer.stats.cycle_errors += 1;
                        warn!(error = %err, class = ?err.class(), "Consumer cycle failed");
                    }
                    stats = consumer.stats.clone();
                    worker = Some((consumer, handler));
                }
                Err(err) => {
                    stats.cycle_errors += 1;
                    error!(error = %err, "Consumer cycle aborted; stopping loop");
                    break;
                }
            }
        }

        info!(
            cycles = stats.cycles,
            delivered = stats.events_delivered,
            "Queue consumer loop stopped"
        );
        stats
    }

    /// Run one cycle on tokio's blocking pool, handing ownership back after.
    ///
    /// A panicking cycle drops the consumer (releasing `consumer.lock`) and
    /// surfaces as `CycleAborted`.
    async fn run_cycle_blocking<H>(
        mut self,
        mut handler: H,
    ) -> Result<(Self, H, Result<CycleReport, QueueError>), QueueError>
    where
        H: BatchHandler + Send + 'static,
    {
        tokio::task::spawn_blocking(move || {
            let result = self.run_cycle(&mut handler);
            (self, handler, result)
        })
        .await
        .map_err(|err| QueueError::CycleAborted {
            message: err.to_string(),
        })
    }

    fn write_heartbeat(&self, last_batch: usize, batch_full: bool) {
        let pending = self.log.overflow().pending_count().unwrap_or(0);
        let backlog_hint = pending + u64::from(batch_full);
        if let Err(err) = self.heartbeat.beat(
            self.stats.cycles,
            last_batch,
            backlog_hint,
            &self.checkpoint.offset,
            self.stats.quarantined_total,
        ) {
            warn!(error = %err, "Failed to write consumer heartbeat");
        }
    }
}
