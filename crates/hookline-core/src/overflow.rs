//! Overflow shards: the second write path for events the primary log could
//! not take in time, and the idempotent merge that folds them back in.
//!
//! ```text
//! queue/overflow/
//!   overflow.lock                         producer appends and sealing
//!   merge.lock                            one merge at a time
//!   overflow.jsonl                        live shard, appended by producers
//!   pending-00000003-<ms>-<nonce>.jsonl   sealed shards awaiting merge
//!   merge-state.json                      per-shard watermarks
//! ```
//!
//! A merge seals the live shard by renaming it, then replays each sealed
//! shard into the canonical log in arrival-time order. Every merged record
//! carries an `origin` marker (shard name plus index), and the watermark is
//! persisted after each durable chunk. After a crash the watermark is
//! reconciled against the markers already present in the canonical log, so
//! no record is ever appended twice. Merges hold `merge.lock` for the whole
//! pass, so two handles on one directory never replay the same range.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::QueueError;
use crate::event::{Event, MergeOrigin, decode_line, encode_line};
use crate::event_log::{AppendAck, AppendRoute, EventLog, open_for_append, repair_torn_tail};
use crate::file_lock::{LockError, LockFile};
use crate::persist::{self, JsonFile};

const LIVE_SHARD: &str = "overflow.jsonl";
const PENDING_PREFIX: &str = "pending-";
const PENDING_SUFFIX: &str = ".jsonl";

/// Overflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverflowConfig {
    /// Bounded wait for the overflow lock on the producer path.
    pub lock_timeout_ms: u64,
    pub lock_poll_ms: u64,
    /// Bounded wait for the overflow lock when sealing the live shard.
    pub seal_lock_timeout_ms: u64,
    /// Bounded wait for `merge.lock`; on timeout the pass is deferred.
    pub merge_lock_timeout_ms: u64,
    /// Records appended to the canonical log per lock hold.
    pub merge_chunk_size: usize,
    /// Upper bound on records merged by one `merge_pending` call.
    pub merge_max_events_per_pass: usize,
}

impl Default for OverflowConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 250,
            lock_poll_ms: 2,
            seal_lock_timeout_ms: 2_000,
            merge_lock_timeout_ms: 5_000,
            merge_chunk_size: 256,
            merge_max_events_per_pass: 10_000,
        }
    }
}

/// Result of one merge pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    /// Sealed shards fully merged and deleted.
    pub shards_merged: usize,
    /// Records appended to the canonical log.
    pub events_merged: usize,
    /// Records found already present (watermark or canonical markers).
    pub skipped_already_merged: usize,
    /// Malformed shard lines dropped to quarantine.
    pub quarantined: u64,
    /// The per-pass budget stopped the merge early.
    pub budget_exhausted: bool,
    /// Another merge held `merge.lock`; nothing was done.
    pub deferred: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ShardProgress {
    /// First canonical segment that can contain this shard's markers.
    start_segment: u64,
    /// Records (in arrival order) already durably merged.
    merged: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MergeState {
    next_seq: u64,
    shards: BTreeMap<String, ShardProgress>,
}

/// Manager for the overflow shard directory.
#[derive(Debug)]
pub struct OverflowShards {
    dir: PathBuf,
    live_path: PathBuf,
    lock_path: PathBuf,
    merge_lock_path: PathBuf,
    state_path: PathBuf,
    config: OverflowConfig,
}

impl OverflowShards {
    pub fn open(dir: impl Into<PathBuf>, config: OverflowConfig) -> Result<Self, QueueError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            live_path: dir.join(LIVE_SHARD),
            lock_path: dir.join("overflow.lock"),
            merge_lock_path: dir.join("merge.lock"),
            state_path: dir.join("merge-state.json"),
            dir,
            config,
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    #[must_use]
    pub fn config(&self) -> &OverflowConfig {
        &self.config
    }

    /// Append one event directly to the live shard.
    pub fn append_overflow(&self, event: &Event) -> Result<AppendAck, QueueError> {
        let line = encode_line(event)?;
        self.append_line(&line)?;
        Ok(AppendAck {
            route: AppendRoute::Overflow,
            offset: None,
            bytes: line.len(),
        })
    }

    /// Append an encoded line to the live shard and fsync it.
    ///
    /// A lock timeout surfaces as `WriteTimeout`; `EventLog` turns that into
    /// `Saturated` when the primary path had already timed out.
    pub fn append_line(&self, line: &[u8]) -> Result<(), QueueError> {
        let _lock = LockFile::acquire_with_wait(
            &self.lock_path,
            Duration::from_millis(self.config.lock_timeout_ms),
            Duration::from_millis(self.config.lock_poll_ms),
        )?;
        let mut file = open_for_append(&self.live_path)?;
        repair_torn_tail(&mut file, &self.live_path)?;
        file.write_all(line)?;
        file.sync_data()?;
        Ok(())
    }

    /// Complete records waiting in the live and sealed shards.
    pub fn pending_count(&self) -> Result<u64, QueueError> {
        let mut total = 0;
        if self.live_path.exists() {
            total += count_complete_lines(&self.live_path)?;
        }
        for (_, path) in self.sealed_shards()? {
            total += count_complete_lines(&path)?;
        }
        Ok(total)
    }

    /// Fold every sealed shard (and the current live shard) into `log`.
    ///
    /// Safe to re-run after a crash at any point: records already present in
    /// the canonical log are skipped. Returns a `deferred` report when another
    /// merge holds `merge.lock` past `merge_lock_timeout_ms`.
    pub fn merge_pending(&self, log: &EventLog) -> Result<MergeReport, QueueError> {
        let mut report = MergeReport::default();
        // Watermarks are read and written only under this lock.
        let _merge_lock = match LockFile::acquire_with_wait(
            &self.merge_lock_path,
            Duration::from_millis(self.config.merge_lock_timeout_ms),
            Duration::from_millis(self.config.lock_poll_ms),
        ) {
            Ok(lock) => lock,
            Err(LockError::Timeout { waited_ms, .. }) => {
                debug!(waited_ms, "Merge lock busy; merge deferred");
                report.deferred = true;
                return Ok(report);
            }
            Err(LockError::Io(err)) => return Err(err.into()),
        };
        let mut state = self.load_state();

        self.seal_live(log, &mut state)?;

        let shards = self.sealed_shards()?;
        let before = state.shards.len();
        state
            .shards
            .retain(|name, _| shards.iter().any(|(_, p)| file_name(p) == *name));
        if state.shards.len() != before {
            self.save_state(&state)?;
        }

        let mut budget = self.config.merge_max_events_per_pass.max(1);
        for (_, path) in shards {
            let name = file_name(&path);
            let done = self.merge_shard(log, &path, &name, &mut state, &mut budget, &mut report)?;
            if !done {
                report.budget_exhausted = true;
                break;
            }
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            state.shards.remove(&name);
            self.save_state(&state)?;
            report.shards_merged += 1;
        }

        if report.events_merged > 0 || report.shards_merged > 0 {
            info!(
                shards = report.shards_merged,
                events = report.events_merged,
                skipped = report.skipped_already_merged,
                budget_exhausted = report.budget_exhausted,
                "Merged overflow shards into canonical log"
            );
        }
        Ok(report)
    }

    /// Returns `true` when the shard is fully merged.
    fn merge_shard(
        &self,
        log: &EventLog,
        path: &Path,
        name: &str,
        state: &mut MergeState,
        budget: &mut usize,
        report: &mut MergeReport,
    ) -> Result<bool, QueueError> {
        let (mut events, quarantined) = read_shard(path, log.quarantine_path())?;
        report.quarantined += quarantined;
        events.sort_by(|a, b| {
            a.ts_ms
                .cmp(&b.ts_ms)
                .then_with(|| a.event_id.cmp(&b.event_id))
        });

        let progress = state.shards.entry(name.to_string()).or_default().clone();
        let mut merged = progress.merged;
        if let Some(max_index) = log.max_origin_index(name, progress.start_segment)? {
            if max_index + 1 > merged {
                debug!(
                    shard = name,
                    watermark = merged,
                    recovered = max_index + 1,
                    "Recovered merge watermark from canonical markers"
                );
                merged = max_index + 1;
            }
        }
        let merged_start = (merged as usize).min(events.len());
        report.skipped_already_merged += merged_start;

        let chunk_size = self.config.merge_chunk_size.max(1);
        let mut next = merged_start;
        while next < events.len() {
            if *budget == 0 {
                return Ok(false);
            }
            let end = (next + chunk_size.min(*budget)).min(events.len());
            let chunk: Vec<Event> = events[next..end]
                .iter()
                .enumerate()
                .map(|(i, event)| {
                    let mut event = event.clone();
                    event.origin = Some(MergeOrigin {
                        shard: name.to_string(),
                        index: (next + i) as u64,
                    });
                    event
                })
                .collect();

            log.append_canonical(&chunk)?;
            report.events_merged += chunk.len();
            *budget -= chunk.len();
            next = end;

            if let Some(entry) = state.shards.get_mut(name) {
                entry.merged = next as u64;
            }
            self.save_state(state)?;
        }
        Ok(true)
    }

    fn seal_live(&self, log: &EventLog, state: &mut MergeState) -> Result<(), QueueError> {
        let lock = match LockFile::acquire_with_wait(
            &self.lock_path,
            Duration::from_millis(self.config.seal_lock_timeout_ms),
            Duration::from_millis(self.config.lock_poll_ms),
        ) {
            Ok(lock) => lock,
            Err(LockError::Timeout { waited_ms, .. }) => {
                warn!(waited_ms, "Overflow lock busy; sealing deferred to next merge");
                return Ok(());
            }
            Err(LockError::Io(err)) => return Err(err.into()),
        };

        let len = match fs::metadata(&self.live_path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
            Err(err) => return Err(err.into()),
        };
        if len == 0 {
            return Ok(());
        }

        // A crash between rename and state save leaves a shard the state
        // never saw; never reuse its sequence number.
        let highest = self
            .sealed_shards()?
            .last()
            .map_or(0, |(seq, _)| seq + 1);
        let seq = state.next_seq.max(highest);
        // The suffix keeps names unique even when a lost merge state resets
        // `next_seq`, so old canonical origin markers never match a new shard.
        let sealed = self.dir.join(format!(
            "{PENDING_PREFIX}{seq:08}-{}-{:08x}{PENDING_SUFFIX}",
            persist::epoch_ms_now(),
            rand::random::<u32>()
        ));
        let start_segment = log.active_segment_id()?;

        fs::rename(&self.live_path, &sealed)?;
        drop(lock);

        state.next_seq = seq + 1;
        state.shards.insert(
            file_name(&sealed),
            ShardProgress {
                start_segment,
                merged: 0,
            },
        );
        self.save_state(state)?;
        debug!(shard = %sealed.display(), bytes = len, "Sealed live overflow shard");
        Ok(())
    }

    fn sealed_shards(&self) -> Result<Vec<(u64, PathBuf)>, QueueError> {
        let mut shards = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let name = file_name(&path);
            let Some(seq) = name
                .strip_prefix(PENDING_PREFIX)
                .and_then(|rest| rest.strip_suffix(PENDING_SUFFIX))
                .and_then(|rest| rest.split('-').next())
                .and_then(|digits| digits.parse::<u64>().ok())
            else {
                continue;
            };
            shards.push((seq, path));
        }
        shards.sort_by_key(|(seq, _)| *seq);
        Ok(shards)
    }

    fn load_state(&self) -> MergeState {
        match persist::read_json::<MergeState>(&self.state_path) {
            Ok(JsonFile::Loaded(state)) => state,
            Ok(JsonFile::Missing) => MergeState::default(),
            Ok(JsonFile::Corrupt(reason)) => {
                warn!(
                    path = %self.state_path.display(),
                    reason = %reason,
                    "Merge state unreadable; reconciling from canonical markers"
                );
                MergeState::default()
            }
            Err(err) => {
                warn!(
                    path = %self.state_path.display(),
                    error = %err,
                    "Failed to read merge state; reconciling from canonical markers"
                );
                MergeState::default()
            }
        }
    }

    fn save_state(&self, state: &MergeState) -> Result<(), QueueError> {
        persist::write_json_atomic(&self.state_path, state, true)?;
        Ok(())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn read_shard(path: &Path, quarantine: &Path) -> Result<(Vec<Event>, u64), QueueError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut events = Vec::new();
    let mut quarantined = 0;
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 || line.last() != Some(&b'\n') {
            break;
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match decode_line(&line) {
            Ok(event) => events.push(event),
            Err(err) => {
                quarantined += 1;
                debug!(shard = %path.display(), error = %err, "Quarantining malformed shard line");
                if let Err(io_err) = persist::append_line(quarantine, &line) {
                    warn!(error = %io_err, "Failed to write quarantine file");
                }
            }
        }
    }
    Ok((events, quarantined))
}

fn count_complete_lines(path: &Path) -> Result<u64, QueueError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };
    let mut reader = BufReader::new(file);
    let mut count = 0;
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 || line.last() != Some(&b'\n') {
            break;
        }
        if !line.iter().all(u8::is_ascii_whitespace) {
            count += 1;
        }
    }
    Ok(count)
}
