//! Small-file persistence helpers shared by the checkpoint, merge-state,
//! heartbeat, and advisory-state writers.
//!
//! Every JSON state file is replaced atomically (write temp, optionally
//! fsync, rename) so a reader never observes a half-written document.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Current wall-clock time in epoch milliseconds.
#[must_use]
pub fn epoch_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Create the parent directory of `path` if it does not exist yet.
pub fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
///
/// With `durable` set the temp file is fsync'd before the rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T, durable: bool) -> io::Result<()> {
    ensure_parent_dir(path)?;
    let bytes = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    // Unique per writer so two threads replacing the same file never share
    // a temp path.
    static TMP_SEQ: AtomicU64 = AtomicU64::new(0);
    let tmp_path = path.with_extension(format!(
        "tmp.{}.{}",
        std::process::id(),
        TMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    {
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(&bytes)?;
        if durable {
            tmp.sync_all()?;
        }
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Outcome of reading an optional JSON state file.
#[derive(Debug)]
pub enum JsonFile<T> {
    /// File does not exist or is empty.
    Missing,
    /// File parsed successfully.
    Loaded(T),
    /// File exists but could not be parsed.
    Corrupt(String),
}

/// Read and parse a JSON state file, distinguishing missing from corrupt.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<JsonFile<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(JsonFile::Missing),
        Err(err) => return Err(err),
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(JsonFile::Missing);
    }
    match serde_json::from_slice::<T>(&bytes) {
        Ok(value) => Ok(JsonFile::Loaded(value)),
        Err(err) => Ok(JsonFile::Corrupt(err.to_string())),
    }
}

/// Append one already-terminated line to `path`, creating it if needed.
///
/// Used for best-effort side files (quarantine); not for the event log.
pub fn append_line(path: &Path, line: &[u8]) -> io::Result<()> {
    ensure_parent_dir(path)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line)?;
    if !line.ends_with(b"\n") {
        file.write_all(b"\n")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        a: u64,
        b: String,
    }

    #[test]
    fn atomic_write_then_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/state.json");
        let value = Sample {
            a: 7,
            b: "x".to_string(),
        };
        write_json_atomic(&path, &value, true).unwrap();

        match read_json::<Sample>(&path).unwrap() {
            JsonFile::Loaded(back) => assert_eq!(back, value),
            other => panic!("expected loaded, got {other:?}"),
        }
        // No temp files left behind.
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains("tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn read_distinguishes_missing_empty_and_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        assert!(matches!(
            read_json::<Sample>(&path).unwrap(),
            JsonFile::Missing
        ));

        fs::write(&path, b"  \n").unwrap();
        assert!(matches!(
            read_json::<Sample>(&path).unwrap(),
            JsonFile::Missing
        ));

        fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            read_json::<Sample>(&path).unwrap(),
            JsonFile::Corrupt(_)
        ));
    }

    #[test]
    fn append_line_terminates_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("q.jsonl");
        append_line(&path, b"one").unwrap();
        append_line(&path, b"two\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "one\ntwo\n");
    }
}
