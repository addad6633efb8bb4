//! Shared advisory state: cooldown/dedupe entries and the fallback-ratio
//! window.
//!
//! Hook processes are short-lived and concurrent, so the state lives in
//! `advisory/state.json` and every admission reloads it under a bounded fs2
//! lock, applies the decision, and writes it back atomically. When the lock
//! is contended past its timeout the decision is made from the in-memory
//! copy and persistence is skipped for that call. A corrupt state file is
//! logged and replaced with empty state; it never fails a decision.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::advisory_engine::AdvisoryConfig;
use crate::file_lock::{LockError, LockFile};
use crate::persist::{self, JsonFile};
use crate::ring_buffer::RingBuffer;

const STATE_VERSION: u32 = 1;
const LOCK_POLL: Duration = Duration::from_millis(1);

#[derive(Error, Debug)]
pub enum AdvisoryStateError {
    #[error("advisory state {path} is corrupt: {reason}")]
    StateCorruption { path: String, reason: String },

    #[error("advisory state lock busy: {0}")]
    LockBusy(String),

    #[error("advisory state I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One decision's contribution to the fallback-ratio window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowOutcome {
    Emitted,
    FallbackEmitted,
    Suppressed,
    NoAdvice,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownEntry {
    pub key: String,
    pub last_shown_ms: u64,
    pub expiry_ms: u64,
}

/// A key to check and, on admission, arm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CooldownKey {
    pub key: String,
    /// Zero disables this key.
    pub cooldown_ms: u64,
}

impl CooldownKey {
    pub fn new(key: impl Into<String>, cooldown_ms: u64) -> Self {
        Self {
            key: key.into(),
            cooldown_ms,
        }
    }
}

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admitted,
    Cooldown { key: String, remaining_ms: u64 },
    FallbackGuard { ratio: f64 },
}

/// Guard and sizing knobs taken from [`AdvisoryConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct StatePolicy {
    pub fallback_guard_enabled: bool,
    pub fallback_guard_max_ratio: f64,
    pub fallback_guard_window: usize,
    pub fallback_guard_min_samples: usize,
    pub state_lock_timeout_ms: u64,
    pub max_cooldown_entries: usize,
}

impl From<&AdvisoryConfig> for StatePolicy {
    fn from(config: &AdvisoryConfig) -> Self {
        Self {
            fallback_guard_enabled: config.fallback_guard_enabled,
            fallback_guard_max_ratio: config.fallback_guard_max_ratio,
            fallback_guard_window: config.fallback_guard_window,
            fallback_guard_min_samples: config.fallback_guard_min_samples,
            state_lock_timeout_ms: config.state_lock_timeout_ms,
            max_cooldown_entries: config.max_cooldown_entries,
        }
    }
}

/// Point-in-time view for reporting and tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub cooldown_entries: usize,
    pub window: Vec<WindowOutcome>,
    pub fallback_ratio: f64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    version: u32,
    updated_at_ms: u64,
    cooldowns: Vec<CooldownEntry>,
    window: Vec<WindowOutcome>,
}

#[derive(Debug)]
struct StateInner {
    cooldowns: HashMap<String, CooldownEntry>,
    window: RingBuffer<WindowOutcome>,
}

impl StateInner {
    fn empty(capacity: usize) -> Self {
        Self {
            cooldowns: HashMap::new(),
            window: RingBuffer::new(capacity),
        }
    }

    fn from_persisted(state: PersistedState, capacity: usize) -> Self {
        Self {
            cooldowns: state
                .cooldowns
                .into_iter()
                .map(|e| (e.key.clone(), e))
                .collect(),
            window: RingBuffer::from_items(capacity, state.window),
        }
    }

    fn to_persisted(&self, now_ms: u64) -> PersistedState {
        let mut cooldowns: Vec<_> = self.cooldowns.values().cloned().collect();
        cooldowns.sort_by(|a, b| a.key.cmp(&b.key));
        PersistedState {
            version: STATE_VERSION,
            updated_at_ms: now_ms,
            cooldowns,
            window: self.window.to_vec(),
        }
    }

    fn prune(&mut self, now_ms: u64) {
        self.cooldowns.retain(|_, e| e.expiry_ms > now_ms);
    }

    fn fallback_ratio(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let fallback = self
            .window
            .count_where(|o| *o == WindowOutcome::FallbackEmitted);
        fallback as f64 / self.window.len() as f64
    }
}

/// Engine-owned advisory state, shared across threads and processes.
#[derive(Debug)]
pub struct AdvisoryStateStore {
    path: Option<PathBuf>,
    lock_path: Option<PathBuf>,
    policy: StatePolicy,
    inner: Mutex<StateInner>,
}

impl AdvisoryStateStore {
    /// Open the store at `path`. Never fails: unreadable state is reset.
    pub fn open(path: impl Into<PathBuf>, config: &AdvisoryConfig) -> Self {
        let path = path.into();
        let policy = StatePolicy::from(config);
        let capacity = policy.fallback_guard_window.max(1);
        let inner = match load(&path, capacity) {
            Ok(Some(inner)) => inner,
            Ok(None) => StateInner::empty(capacity),
            Err(err) => {
                warn!(error = %err, "Resetting advisory state");
                StateInner::empty(capacity)
            }
        };
        Self {
            lock_path: Some(path.with_extension("lock")),
            path: Some(path),
            policy,
            inner: Mutex::new(inner),
        }
    }

    /// Process-local store with no backing file.
    #[must_use]
    pub fn in_memory(config: &AdvisoryConfig) -> Self {
        let policy = StatePolicy::from(config);
        let capacity = policy.fallback_guard_window.max(1);
        Self {
            path: None,
            lock_path: None,
            policy,
            inner: Mutex::new(StateInner::empty(capacity)),
        }
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Check cooldowns and the fallback guard for a candidate and, when it
    /// passes, arm its cooldown keys. Every call pushes exactly one window
    /// outcome.
    pub fn admit(&self, keys: &[CooldownKey], is_fallback: bool, now_ms: u64) -> Admission {
        self.with_state(now_ms, |state| {
            for key in keys.iter().filter(|k| k.cooldown_ms > 0) {
                if let Some(entry) = state.cooldowns.get(&key.key) {
                    if entry.expiry_ms > now_ms {
                        state.window.push(WindowOutcome::Suppressed);
                        return Admission::Cooldown {
                            key: key.key.clone(),
                            remaining_ms: entry.expiry_ms - now_ms,
                        };
                    }
                }
            }

            if is_fallback && self.policy.fallback_guard_enabled {
                let ratio = state.fallback_ratio();
                if state.window.len() >= self.policy.fallback_guard_min_samples
                    && ratio > self.policy.fallback_guard_max_ratio
                {
                    state.window.push(WindowOutcome::Suppressed);
                    return Admission::FallbackGuard { ratio };
                }
            }

            for key in keys.iter().filter(|k| k.cooldown_ms > 0) {
                state.cooldowns.insert(
                    key.key.clone(),
                    CooldownEntry {
                        key: key.key.clone(),
                        last_shown_ms: now_ms,
                        expiry_ms: now_ms.saturating_add(key.cooldown_ms),
                    },
                );
            }
            self.enforce_entry_cap(state);
            state.window.push(if is_fallback {
                WindowOutcome::FallbackEmitted
            } else {
                WindowOutcome::Emitted
            });
            Admission::Admitted
        })
    }

    /// Push an outcome that did not go through `admit` (no advice).
    pub fn record_outcome(&self, outcome: WindowOutcome, now_ms: u64) {
        self.with_state(now_ms, |state| {
            state.window.push(outcome);
        });
    }

    #[must_use]
    pub fn fallback_ratio(&self) -> f64 {
        self.lock_inner().fallback_ratio()
    }

    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.lock_inner();
        StateSnapshot {
            cooldown_entries: inner.cooldowns.len(),
            window: inner.window.to_vec(),
            fallback_ratio: inner.fallback_ratio(),
        }
    }

    /// Reload, mutate, and persist under the in-process mutex and the
    /// cross-process file lock.
    fn with_state<R>(&self, now_ms: u64, f: impl FnOnce(&mut StateInner) -> R) -> R {
        let mut inner = self.lock_inner();
        let file_lock = self.acquire_file_lock();

        if let (Some(_), Some(path)) = (&file_lock, &self.path) {
            match load(path, self.policy.fallback_guard_window.max(1)) {
                Ok(Some(disk)) => *inner = disk,
                Ok(None) => {}
                Err(err) => warn!(error = %err, "Ignoring unreadable advisory state on disk"),
            }
        }

        inner.prune(now_ms);
        let result = f(&mut inner);

        if let (Some(_), Some(path)) = (&file_lock, &self.path) {
            if let Err(err) = persist::write_json_atomic(path, &inner.to_persisted(now_ms), false) {
                warn!(path = %path.display(), error = %err, "Failed to persist advisory state");
            }
        }
        result
    }

    fn acquire_file_lock(&self) -> Option<LockFile> {
        let lock_path = self.lock_path.as_ref()?;
        match LockFile::acquire_with_wait(
            lock_path,
            Duration::from_millis(self.policy.state_lock_timeout_ms),
            LOCK_POLL,
        ) {
            Ok(lock) => Some(lock),
            Err(err) => {
                let err = match err {
                    LockError::Timeout { waited_ms, .. } => {
                        AdvisoryStateError::LockBusy(format!("waited {waited_ms}ms"))
                    }
                    LockError::Io(io) => AdvisoryStateError::Io(io),
                };
                warn!(error = %err, "Deciding from in-memory advisory state; persist skipped");
                None
            }
        }
    }

    fn enforce_entry_cap(&self, state: &mut StateInner) {
        let cap = self.policy.max_cooldown_entries.max(1);
        if state.cooldowns.len() <= cap {
            return;
        }
        let mut by_expiry: Vec<(u64, String)> = state
            .cooldowns
            .values()
            .map(|e| (e.expiry_ms, e.key.clone()))
            .collect();
        by_expiry.sort();
        let excess = state.cooldowns.len() - cap;
        for (_, key) in by_expiry.into_iter().take(excess) {
            state.cooldowns.remove(&key);
        }
        debug!(evicted = excess, "Evicted oldest cooldown entries");
    }

    fn lock_inner(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn load(path: &Path, capacity: usize) -> Result<Option<StateInner>, AdvisoryStateError> {
    match persist::read_json::<PersistedState>(path)? {
        JsonFile::Loaded(state) => Ok(Some(StateInner::from_persisted(state, capacity))),
        JsonFile::Missing => Ok(None),
        JsonFile::Corrupt(reason) => Err(AdvisoryStateError::StateCorruption {
            path: path.display().to_string(),
            reason,
        }),
    }
}
