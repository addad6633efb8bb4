//! Segmented append-only event log with cross-process writers.
//!
//! Layout under the queue directory:
//!
//! ```text
//! queue/
//!   events.lock              exclusive writer lock (fs2)
//!   segments/0000000000000000.jsonl
//!   segments/0000000000000001.jsonl   <- active (highest id)
//!   quarantine.jsonl         malformed lines copied here on read
//!   overflow/                see `overflow`
//! ```
//!
//! Writers take the lock with a bounded wait, repair a torn tail left by a
//! crashed writer, roll the active segment when it is full, and write each
//! record with a single `write_all` followed by `sync_data`. Readers only
//! return `\n`-terminated lines, so a partially written record is invisible.
//! A lock timeout or an over-cap log transparently routes the record to the
//! overflow shard instead of blocking or dropping it.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::QueueError;
use crate::event::{Event, decode_line, encode_line};
use crate::file_lock::{LockError, LockFile};
use crate::overflow::{MergeReport, OverflowConfig, OverflowShards};
use crate::persist;

const SEGMENT_EXT: &str = "jsonl";
const TAIL_SCAN_CHUNK: u64 = 4096;

// =============================================================================
// Configuration
// =============================================================================

/// Event log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    /// Bounded wait for the writer lock before routing to overflow.
    pub lock_timeout_ms: u64,
    /// Poll interval while waiting for the writer lock.
    pub lock_poll_ms: u64,
    /// Bounded wait used by overflow merges (consumer side, may wait longer).
    pub merge_lock_timeout_ms: u64,
    /// Active segment is sealed and a new one started past this size.
    pub segment_max_bytes: u64,
    /// Total log size cap; above it producers divert to overflow and the
    /// consumer rotates fully-consumed segments out.
    pub max_total_bytes: u64,
    /// Largest single encoded record accepted.
    pub max_record_bytes: usize,
    /// fsync the segment after every append.
    pub fsync_on_append: bool,
    /// Consecutive double-timeouts before an error-level health alert.
    pub saturation_alert_threshold: u32,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 50,
            lock_poll_ms: 2,
            merge_lock_timeout_ms: 2_000,
            segment_max_bytes: 8 * 1024 * 1024,
            max_total_bytes: 64 * 1024 * 1024,
            max_record_bytes: 256 * 1024,
            fsync_on_append: true,
            saturation_alert_threshold: 3,
        }
    }
}

impl EventLogConfig {
    /// Validate config for runtime safety.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.segment_max_bytes == 0 {
            return Err(QueueError::InvalidRecord {
                message: "segment_max_bytes must be >= 1".to_string(),
            });
        }
        if self.max_total_bytes < self.segment_max_bytes {
            return Err(QueueError::InvalidRecord {
                message: "max_total_bytes must be >= segment_max_bytes".to_string(),
            });
        }
        if self.max_record_bytes == 0 {
            return Err(QueueError::InvalidRecord {
                message: "max_record_bytes must be >= 1".to_string(),
            });
        }
        Ok(())
    }

    fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    fn lock_poll(&self) -> Duration {
        Duration::from_millis(self.lock_poll_ms)
    }
}

// =============================================================================
// Offsets and results
// =============================================================================

/// Position in the log: segment id plus byte offset within the segment.
///
/// Ordered lexicographically, which matches read order.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogOffset {
    pub segment_id: u64,
    pub byte_offset: u64,
}

impl LogOffset {
    #[must_use]
    pub const fn new(segment_id: u64, byte_offset: u64) -> Self {
        Self {
            segment_id,
            byte_offset,
        }
    }
}

impl std::fmt::Display for LogOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.segment_id, self.byte_offset)
    }
}

/// Which write path accepted a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppendRoute {
    Primary,
    Overflow,
}

/// Why a record was routed to overflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowTrigger {
    LockTimeout,
    SizeCap,
}

/// Acknowledgement for an accepted record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendAck {
    pub route: AppendRoute,
    /// Canonical position; `None` until an overflow record is merged.
    pub offset: Option<LogOffset>,
    pub bytes: usize,
}

/// Records read from a starting offset.
#[derive(Debug, Clone, Default)]
pub struct ReadBatch {
    /// Decoded records with their start offsets, in log order.
    pub records: Vec<(LogOffset, Event)>,
    /// Offset just past the last line consumed (valid or quarantined).
    pub next_offset: LogOffset,
    /// Malformed lines skipped by this read.
    pub quarantined: u64,
}

/// Segments removed by a rotation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationReport {
    pub removed_segments: Vec<u64>,
    pub bytes_freed: u64,
    pub total_bytes_after: u64,
}

/// Snapshot of on-disk log size.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStats {
    pub segments: usize,
    pub total_bytes: u64,
    pub active_segment: u64,
}

/// Producer-side write health counters for this handle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteHealth {
    pub primary_appends: u64,
    pub primary_timeouts: u64,
    pub overflow_routed: u64,
    pub size_cap_diversions: u64,
    pub saturations: u64,
    pub consecutive_saturations: u32,
    pub alerting: bool,
    pub last_error: Option<String>,
}

// =============================================================================
// Segment layout
// =============================================================================

#[derive(Debug, Clone)]
pub(crate) struct SegmentInfo {
    pub(crate) id: u64,
    pub(crate) path: PathBuf,
    pub(crate) len: u64,
}

impl SegmentInfo {
    fn fully_consumed_by(&self, head: &LogOffset) -> bool {
        head.segment_id > self.id || (head.segment_id == self.id && head.byte_offset >= self.len)
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct SegmentLayout {
    pub(crate) segments: Vec<SegmentInfo>,
    pub(crate) total_bytes: u64,
}

impl SegmentLayout {
    fn active_id(&self) -> u64 {
        self.segments.last().map_or(0, |s| s.id)
    }
}

// =============================================================================
// EventLog
// =============================================================================

/// Handle to the on-disk event log. Cheap to open per producer process.
#[derive(Debug)]
pub struct EventLog {
    dir: PathBuf,
    segments_dir: PathBuf,
    lock_path: PathBuf,
    quarantine_path: PathBuf,
    config: EventLogConfig,
    overflow: OverflowShards,
    health: Mutex<WriteHealth>,
}

impl EventLog {
    /// Open (creating if needed) the log under `dir`.
    pub fn open(
        dir: impl Into<PathBuf>,
        config: EventLogConfig,
        overflow: OverflowConfig,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        let dir = dir.into();
        let segments_dir = dir.join("segments");
        fs::create_dir_all(&segments_dir)?;
        let overflow = OverflowShards::open(dir.join("overflow"), overflow)?;

        Ok(Self {
            lock_path: dir.join("events.lock"),
            quarantine_path: dir.join("quarantine.jsonl"),
            segments_dir,
            dir,
            config,
            overflow,
            health: Mutex::new(WriteHealth::default()),
        })
    }

    /// Queue directory this log lives in.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the writer lock file.
    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Path of the quarantine side file.
    #[must_use]
    pub fn quarantine_path(&self) -> &Path {
        &self.quarantine_path
    }

    #[must_use]
    pub fn config(&self) -> &EventLogConfig {
        &self.config
    }

    /// The overflow shard manager owned by this log.
    #[must_use]
    pub fn overflow(&self) -> &OverflowShards {
        &self.overflow
    }

    /// Append one event. Never blocks longer than the configured lock wait
    /// (plus the overflow wait when the primary path is contended).
    pub fn append(&self, event: &Event) -> Result<AppendAck, QueueError> {
        let line = encode_line(event)?;
        if line.len() > self.config.max_record_bytes {
            return Err(QueueError::InvalidRecord {
                message: format!(
                    "record of {} bytes exceeds max {}",
                    line.len(),
                    self.config.max_record_bytes
                ),
            });
        }

        let lock = match LockFile::acquire_with_wait(
            &self.lock_path,
            self.config.lock_timeout(),
            self.config.lock_poll(),
        ) {
            Ok(lock) => lock,
            Err(LockError::Timeout { waited_ms, .. }) => {
                self.with_health(|h| h.primary_timeouts += 1);
                debug!(
                    event_id = %event.event_id,
                    waited_ms,
                    "Primary log contended; routing event to overflow"
                );
                return self.append_via_overflow(&line, OverflowTrigger::LockTimeout, waited_ms);
            }
            Err(LockError::Io(err)) => return Err(err.into()),
        };

        let layout = self.scan_segments()?;
        if layout.total_bytes + line.len() as u64 > self.config.max_total_bytes {
            drop(lock);
            debug!(
                event_id = %event.event_id,
                total_bytes = layout.total_bytes,
                cap = self.config.max_total_bytes,
                "Primary log over size cap; routing event to overflow"
            );
            return self.append_via_overflow(&line, OverflowTrigger::SizeCap, 0);
        }

        let offsets = self.write_locked(&layout, std::slice::from_ref(&line), self.config.fsync_on_append)?;
        drop(lock);

        self.with_health(|h| {
            h.primary_appends += 1;
            h.consecutive_saturations = 0;
            h.alerting = false;
        });
        Ok(AppendAck {
            route: AppendRoute::Primary,
            offset: offsets.into_iter().next(),
            bytes: line.len(),
        })
    }

    /// Append already-ordered events to the canonical log in one lock hold.
    ///
    /// Used by the overflow merge: ignores the size cap, always fsyncs, and
    /// waits up to `merge_lock_timeout_ms` before failing with `WriteTimeout`.
    pub fn append_canonical(&self, events: &[Event]) -> Result<Vec<LogOffset>, QueueError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let lines = events
            .iter()
            .map(encode_line)
            .collect::<Result<Vec<_>, _>>()?;

        let _lock = LockFile::acquire_with_wait(
            &self.lock_path,
            Duration::from_millis(self.config.merge_lock_timeout_ms),
            self.config.lock_poll(),
        )?;
        let layout = self.scan_segments()?;
        self.write_locked(&layout, &lines, true)
    }

    /// Read up to `max_records` complete records starting at `start`.
    ///
    /// Malformed lines are skipped, counted, and copied to the quarantine
    /// file. Reading stops at the first incomplete (unterminated) line.
    pub fn read_from(&self, start: &LogOffset, max_records: usize) -> Result<ReadBatch, QueueError> {
        let layout = self.scan_segments()?;
        let mut batch = ReadBatch {
            next_offset: start.clone(),
            ..ReadBatch::default()
        };
        if max_records == 0 {
            return Ok(batch);
        }

        let active_id = layout.active_id();
        for segment in layout.segments.iter().filter(|s| s.id >= start.segment_id) {
            let from = if segment.id == start.segment_id {
                start.byte_offset
            } else {
                0
            };
            batch.next_offset = LogOffset::new(segment.id, from);

            let complete = self.read_segment(segment, from, max_records, &mut batch)?;
            if batch.records.len() >= max_records || !complete {
                break;
            }
            if segment.id == active_id {
                break;
            }
        }

        if batch.quarantined > 0 {
            warn!(
                quarantined = batch.quarantined,
                next_offset = %batch.next_offset,
                "Skipped malformed event log lines"
            );
        }
        Ok(batch)
    }

    /// Returns `true` when the segment was read to its end.
    fn read_segment(
        &self,
        segment: &SegmentInfo,
        from: u64,
        max_records: usize,
        batch: &mut ReadBatch,
    ) -> Result<bool, QueueError> {
        let file = match File::open(&segment.path) {
            Ok(file) => file,
            // Rotated away between scan and open.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(err) => return Err(err.into()),
        };
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(from))?;

        let mut pos = from;
        let mut line = Vec::new();
        loop {
            if batch.records.len() >= max_records {
                return Ok(false);
            }
            line.clear();
            let read = reader.read_until(b'\n', &mut line)?;
            if read == 0 {
                return Ok(true);
            }
            if line.last() != Some(&b'\n') {
                // Partial record still being written (or torn); invisible.
                return Ok(false);
            }

            let record_offset = LogOffset::new(segment.id, pos);
            pos += read as u64;
            batch.next_offset = LogOffset::new(segment.id, pos);

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match decode_line(&line) {
                Ok(event) => batch.records.push((record_offset, event)),
                Err(err) => {
                    batch.quarantined += 1;
                    debug!(offset = %record_offset, error = %err, "Quarantining malformed line");
                    if let Err(io_err) = persist::append_line(&self.quarantine_path, &line) {
                        warn!(error = %io_err, "Failed to write quarantine file");
                    }
                }
            }
        }
    }

    /// Delete the oldest sealed segments that are fully behind `head` while
    /// the log exceeds `max_total_bytes`. Unconsumed data is never removed.
    pub fn rotate(&self, head: &LogOffset) -> Result<RotationReport, QueueError> {
        let layout = self.scan_segments()?;
        let active_id = layout.active_id();
        let mut report = RotationReport {
            total_bytes_after: layout.total_bytes,
            ..RotationReport::default()
        };

        for segment in &layout.segments {
            if report.total_bytes_after <= self.config.max_total_bytes {
                break;
            }
            if segment.id == active_id || !segment.fully_consumed_by(head) {
                break;
            }
            match fs::remove_file(&segment.path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            report.removed_segments.push(segment.id);
            report.bytes_freed += segment.len;
            report.total_bytes_after = report.total_bytes_after.saturating_sub(segment.len);
        }

        if !report.removed_segments.is_empty() {
            info!(
                removed = ?report.removed_segments,
                bytes_freed = report.bytes_freed,
                head = %head,
                "Rotated consumed log segments"
            );
        }
        Ok(report)
    }

    /// Current on-disk size snapshot.
    pub fn stats(&self) -> Result<LogStats, QueueError> {
        let layout = self.scan_segments()?;
        Ok(LogStats {
            segments: layout.segments.len(),
            total_bytes: layout.total_bytes,
            active_segment: layout.active_id(),
        })
    }

    /// Id of the segment new writes currently go to.
    pub fn active_segment_id(&self) -> Result<u64, QueueError> {
        Ok(self.scan_segments()?.active_id())
    }

    /// Fold pending overflow shards into the canonical log.
    pub fn merge_pending(&self) -> Result<MergeReport, QueueError> {
        self.overflow.merge_pending(self)
    }

    /// Snapshot of this handle's write health counters.
    #[must_use]
    pub fn write_health(&self) -> WriteHealth {
        match self.health.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Highest merge index recorded in canonical records for `shard`,
    /// scanning segments with id >= `from_segment`.
    pub(crate) fn max_origin_index(
        &self,
        shard: &str,
        from_segment: u64,
    ) -> Result<Option<u64>, QueueError> {
        let layout = self.scan_segments()?;
        let needle = shard.as_bytes();
        let mut best: Option<u64> = None;

        for segment in layout.segments.iter().filter(|s| s.id >= from_segment) {
            let file = match File::open(&segment.path) {
                Ok(file) => file,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            let mut reader = BufReader::new(file);
            let mut line = Vec::new();
            loop {
                line.clear();
                if reader.read_until(b'\n', &mut line)? == 0 || line.last() != Some(&b'\n') {
                    break;
                }
                if memchr::memmem::find(&line, needle).is_none() {
                    continue;
                }
                if let Ok(event) = decode_line(&line) {
                    if let Some(origin) = event.origin.filter(|o| o.shard == shard) {
                        best = Some(best.map_or(origin.index, |b| b.max(origin.index)));
                    }
                }
            }
        }
        Ok(best)
    }

    fn append_via_overflow(
        &self,
        line: &[u8],
        trigger: OverflowTrigger,
        primary_waited_ms: u64,
    ) -> Result<AppendAck, QueueError> {
        match self.overflow.append_line(line) {
            Ok(()) => {
                self.with_health(|h| {
                    h.overflow_routed += 1;
                    if trigger == OverflowTrigger::SizeCap {
                        h.size_cap_diversions += 1;
                    }
                    h.consecutive_saturations = 0;
                    h.alerting = false;
                });
                Ok(AppendAck {
                    route: AppendRoute::Overflow,
                    offset: None,
                    bytes: line.len(),
                })
            }
            Err(QueueError::WriteTimeout { waited_ms, .. }) => {
                let err = QueueError::Saturated {
                    primary_waited_ms,
                    overflow_waited_ms: waited_ms,
                };
                let threshold = self.config.saturation_alert_threshold.max(1);
                let message = err.to_string();
                let consecutive = self.with_health(|h| {
                    h.saturations += 1;
                    h.consecutive_saturations += 1;
                    h.last_error = Some(message.clone());
                    if h.consecutive_saturations >= threshold {
                        h.alerting = true;
                    }
                    h.consecutive_saturations
                });
                if consecutive >= threshold {
                    error!(
                        consecutive,
                        primary_waited_ms,
                        overflow_waited_ms = waited_ms,
                        "Sustained write timeouts on primary and overflow paths; events at risk"
                    );
                } else {
                    warn!(
                        consecutive,
                        primary_waited_ms,
                        overflow_waited_ms = waited_ms,
                        "Both write paths timed out"
                    );
                }
                Err(err)
            }
            Err(err) => {
                let message = err.to_string();
                self.with_health(|h| h.last_error = Some(message));
                Err(err)
            }
        }
    }

    /// Write lines to the active segment. Caller must hold the writer lock.
    fn write_locked(
        &self,
        layout: &SegmentLayout,
        lines: &[Vec<u8>],
        fsync: bool,
    ) -> Result<Vec<LogOffset>, QueueError> {
        let mut segment_id = layout.active_id();
        let mut file = open_for_append(&self.segment_path(segment_id))?;
        let mut len = repair_torn_tail(&mut file, &self.segment_path(segment_id))?;
        let mut offsets = Vec::with_capacity(lines.len());

        for line in lines {
            if len > 0 && len + line.len() as u64 > self.config.segment_max_bytes {
                file.sync_data()?;
                segment_id += 1;
                file = open_for_append(&self.segment_path(segment_id))?;
                len = file.metadata()?.len();
                info!(segment_id, "Rolled to new log segment");
            }
            file.write_all(line)?;
            offsets.push(LogOffset::new(segment_id, len));
            len += line.len() as u64;
        }

        if fsync {
            file.sync_data()?;
        }
        Ok(offsets)
    }

    fn segment_path(&self, id: u64) -> PathBuf {
        self.segments_dir.join(format!("{id:016}.{SEGMENT_EXT}"))
    }

    pub(crate) fn scan_segments(&self) -> Result<SegmentLayout, QueueError> {
        let mut layout = SegmentLayout::default();
        for entry in fs::read_dir(&self.segments_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXT) {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            let len = match entry.metadata() {
                Ok(meta) => meta.len(),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            layout.total_bytes += len;
            layout.segments.push(SegmentInfo { id, path, len });
        }
        layout.segments.sort_by_key(|s| s.id);
        Ok(layout)
    }

    fn with_health<R>(&self, f: impl FnOnce(&mut WriteHealth) -> R) -> R {
        match self.health.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

pub(crate) fn open_for_append(path: &Path) -> Result<File, QueueError> {
    Ok(OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?)
}

/// Truncate a trailing partial record left by a writer that died mid-write.
///
/// Returns the resulting file length. Caller must hold the writer lock.
pub(crate) fn repair_torn_tail(file: &mut File, path: &Path) -> Result<u64, QueueError> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(0);
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(len);
    }

    // Walk backwards to the last complete line.
    let mut end = len;
    let mut keep = 0u64;
    let mut buf = vec![0u8; TAIL_SCAN_CHUNK as usize];
    while end > 0 {
        let start = end.saturating_sub(TAIL_SCAN_CHUNK);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;
        if let Some(idx) = memchr::memrchr(b'\n', chunk) {
            keep = start + idx as u64 + 1;
            break;
        }
        end = start;
    }

    file.set_len(keep)?;
    file.sync_data()?;
    warn!(
        path = %path.display(),
        torn_bytes = len - keep,
        "Truncated torn record at log tail"
    );
    Ok(keep)
}
