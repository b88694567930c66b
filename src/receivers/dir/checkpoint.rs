// SPDX-License-Identifier: Apache-2.0

//! Offset checkpoint store.
//!
//! Keeps the last forwarded `(file, byte offset)` per watched directory. The
//! table is written to one local file, one line per directory:
//!
//! ```text
//! /data/topicA/a.log:1024
//! ```
//!
//! Every save rewrites the whole file through a temp file and a rename. On
//! startup `remedy` reloads the table, skipping malformed lines and entries
//! whose file no longer exists.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use crate::receivers::dir::error::{Error, Result};

/// Last forwarded position within a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// File name, relative to the directory
    pub file: String,
    /// Byte offset up to which the file has been forwarded
    pub offset: u64,
}

impl Checkpoint {
    pub fn new(file: impl Into<String>, offset: u64) -> Self {
        Self {
            file: file.into(),
            offset,
        }
    }
}

/// Thread-safe checkpoint table backed by a local file.
pub struct CheckpointStore {
    path: PathBuf,
    table: Mutex<BTreeMap<PathBuf, Checkpoint>>,
}

impl CheckpointStore {
    /// Create a store persisted at `path`. Nothing is read until `remedy`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            table: Mutex::new(BTreeMap::new()),
        }
    }

    /// Create an in-memory store (useful for testing)
    pub fn open_memory() -> Self {
        Self::new(PathBuf::new())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<PathBuf, Checkpoint>> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or replace the checkpoint of `dir`.
    pub fn update(&self, dir: &Path, file: &str, offset: u64) -> Result<()> {
        if dir.as_os_str().is_empty() || file.is_empty() {
            return Err(Error::Persistence(format!(
                "invalid checkpoint {:?}/{:?}:{}",
                dir, file, offset
            )));
        }

        self.lock()
            .insert(dir.to_path_buf(), Checkpoint::new(file, offset));
        Ok(())
    }

    /// Record `file` as the latest file of `dir` at offset 0, unless the
    /// checkpoint already points at it. Returns true if the table changed.
    pub fn mark(&self, dir: &Path, file: &str) -> Result<bool> {
        if dir.as_os_str().is_empty() || file.is_empty() {
            return Err(Error::Persistence(format!(
                "invalid checkpoint {:?}/{:?}",
                dir, file
            )));
        }

        let mut table = self.lock();
        if table.get(dir).is_some_and(|cp| cp.file == file) {
            return Ok(false);
        }
        table.insert(dir.to_path_buf(), Checkpoint::new(file, 0));
        Ok(true)
    }

    pub fn get(&self, dir: &Path) -> Option<Checkpoint> {
        self.lock().get(dir).cloned()
    }

    pub fn remove(&self, dir: &Path) -> Option<Checkpoint> {
        self.lock().remove(dir)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Write the whole table to disk.
    ///
    /// The snapshot is taken and written under the table lock, so a save
    /// never interleaves with an update.
    pub fn save(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(()); // In-memory mode, nothing to flush
        }

        let table = self.lock();
        let mut contents = String::new();
        for (dir, cp) in table.iter() {
            contents.push_str(&format_line(dir, cp));
            contents.push('\n');
        }

        atomic_write(&self.path, contents.as_bytes())?;
        debug!(entries = table.len(), path = ?self.path, "Saved checkpoints");
        Ok(())
    }

    /// Reload the table from disk. Returns the number of restored entries.
    pub fn remedy(&self) -> Result<usize> {
        if self.path.as_os_str().is_empty() || !self.path.exists() {
            debug!("No checkpoint file found, starting fresh");
            return Ok(0);
        }

        let contents = fs::read_to_string(&self.path).map_err(|e| {
            Error::Persistence(format!("failed to read checkpoint file: {}", e))
        })?;

        let mut table = self.lock();
        let mut restored = 0;
        for (lineno, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }

            let Some((dir, cp)) = parse_line(line) else {
                warn!(line = lineno + 1, content = line, "Skipping malformed checkpoint");
                continue;
            };

            if !dir.join(&cp.file).is_file() {
                debug!(dir = ?dir, file = %cp.file, "Skipping checkpoint for missing file");
                continue;
            }

            table.insert(dir, cp);
            restored += 1;
        }

        info!(restored, path = ?self.path, "Loaded checkpoints");
        Ok(restored)
    }
}

fn format_line(dir: &Path, cp: &Checkpoint) -> String {
    format!("{}:{}", dir.join(&cp.file).display(), cp.offset)
}

/// Parse `<dir>/<file>:<offset>`.
fn parse_line(line: &str) -> Option<(PathBuf, Checkpoint)> {
    let (path, offset) = line.rsplit_once(':')?;
    let offset: u64 = offset.trim().parse().ok()?;

    let path = Path::new(path);
    let dir = path.parent()?;
    let file = path.file_name()?.to_str()?;
    if dir.as_os_str().is_empty() || file.is_empty() {
        return None;
    }

    Some((dir.to_path_buf(), Checkpoint::new(file, offset)))
}

/// Write contents to file atomically (write to temp, then rename)
fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Persistence(format!("failed to create parent directory: {}", e))
            })?;
        }
    }

    let unique_id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let temp_path = path.with_extension(format!("tmp.{}.{}", std::process::id(), unique_id));

    let file = File::create(&temp_path)
        .map_err(|e| Error::Persistence(format!("failed to create temp file: {}", e)))?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(contents)
        .map_err(|e| Error::Persistence(format!("failed to write checkpoints: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Persistence(format!("failed to flush checkpoints: {}", e)))?;
    drop(writer);

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        Error::Persistence(format!("failed to rename checkpoint file: {}", e))
    })?;

    Ok(())
}
