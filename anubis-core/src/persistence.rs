//! Shared persistence utilities: atomic JSON snapshots and bounded log tails.
//!
//! Every store in the crate rewrites its whole backing file on each mutation.
//! Writes go to a hidden temp sibling that is flushed and then renamed over
//! the target, so a concurrent reader sees either the old or the new snapshot.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Upper bound on how much of a log file `read_tail` will read.
pub const MAX_TAIL_BYTES: u64 = 1024 * 1024;

/// Atomically write JSON data to a file.
///
/// Serializes `data` to pretty-printed JSON and hands it to [`atomic_write`].
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Atomically write raw bytes to a file.
///
/// Creates parent directories if they don't exist. The temp file is synced
/// before the rename so a crash never leaves a truncated target behind.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

fn tmp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".to_string());
    path.with_file_name(format!(".{name}.tmp"))
}

/// Load and deserialize JSON from a file.
///
/// Returns `Ok(None)` if the file doesn't exist.
/// Returns `Err` on I/O errors or deserialization failures.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

/// Load JSON, falling back to `T::default()` when the file is missing or
/// unreadable. Startup must never fail because of a damaged snapshot.
pub fn load_json_or_default<T>(path: &Path, what: &str) -> T
where
    T: serde::de::DeserializeOwned + Default,
{
    match load_json(path) {
        Ok(Some(value)) => value,
        Ok(None) => T::default(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable {what} file");
            T::default()
        }
    }
}

/// Open a file for appending, creating it and its parent directory.
pub fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Read the last `lines` lines of a file.
///
/// At most [`MAX_TAIL_BYTES`] are read from the end of the file; if that
/// window starts mid-line, the partial first line is dropped.
pub fn read_tail(path: &Path, lines: usize) -> io::Result<String> {
    if lines == 0 {
        return Ok(String::new());
    }
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let start = len.saturating_sub(MAX_TAIL_BYTES);
    file.seek(SeekFrom::Start(start))?;

    let mut buf = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut buf)?;
    let text = String::from_utf8_lossy(&buf);

    let mut body: &str = &text;
    if start > 0 {
        body = match body.find('\n') {
            Some(idx) => &body[idx + 1..],
            None => "",
        };
    }

    let all: Vec<&str> = body.lines().collect();
    let skip = all.len().saturating_sub(lines);
    let mut tail = all[skip..].join("\n");
    if !tail.is_empty() && body.ends_with('\n') {
        tail.push('\n');
    }
    Ok(tail)
}
