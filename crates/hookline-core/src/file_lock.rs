//! Cross-process advisory file locks with bounded waits.
//!
//! Producers are independent OS processes, so the event log, the overflow
//! shard, and the advisory state file are each serialized through an
//! exclusive `fs2` lock on a sibling `.lock` file. Waiting is always bounded:
//! callers either get the lock within their timeout or get
//! [`LockError::Timeout`] back and pick another path.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, trace};

use crate::persist::ensure_parent_dir;

/// Errors from lock acquisition.
#[derive(Error, Debug)]
pub enum LockError {
    /// The lock was still held by someone else when the wait expired.
    #[error("timed out after {waited_ms}ms waiting for lock {path}")]
    Timeout { path: String, waited_ms: u64 },

    /// Opening or locking the lock file failed for another reason.
    #[error("lock I/O error: {0}")]
    Io(#[from] io::Error),
}

/// An acquired exclusive lock. Released on drop.
#[derive(Debug)]
pub struct LockFile {
    file: File,
    path: PathBuf,
    acquired_at: Instant,
}

impl LockFile {
    /// Try to take the lock once without waiting.
    ///
    /// Returns `Ok(None)` when another holder has it.
    pub fn try_acquire(path: &Path) -> io::Result<Option<Self>> {
        ensure_parent_dir(path)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
                acquired_at: Instant::now(),
            })),
            Err(err) if is_contended(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Acquire the lock, polling every `poll` until `timeout` elapses.
    ///
    /// A zero timeout makes exactly one attempt.
    pub fn acquire_with_wait(
        path: &Path,
        timeout: Duration,
        poll: Duration,
    ) -> Result<Self, LockError> {
        let start = Instant::now();
        let poll = poll.max(Duration::from_millis(1));

        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                let waited = start.elapsed();
                if waited > poll {
                    debug!(
                        lock = %path.display(),
                        waited_ms = waited.as_millis() as u64,
                        "Acquired contended lock"
                    );
                }
                return Ok(lock);
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(LockError::Timeout {
                    path: path.display().to_string(),
                    waited_ms: elapsed.as_millis() as u64,
                });
            }
            std::thread::sleep(poll.min(timeout - elapsed));
        }
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            debug!(lock = %self.path.display(), error = %err, "Failed to release lock");
        }
        trace!(
            lock = %self.path.display(),
            held_us = self.acquired_at.elapsed().as_micros() as u64,
            "Released lock"
        );
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
