// SPDX-License-Identifier: Apache-2.0

//! Failed-message archive.
//!
//! Lines that exhaust their publish attempts are appended to a per-topic file
//! named `<topic>.<unix-time>` in the archive directory. The flusher closes
//! every open file on an interval and, unless archive-only mode is set, hands
//! the closed files back to the delivery workers for another attempt.
//!
//! Files are shared through `Arc` handles. `close_all` drops the cache's
//! handle and marks the file closed; a writer that still holds a handle
//! retries on a fresh file, and the descriptor itself is released with the
//! last handle.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info, warn};

use crate::periodic::PeriodicTask;
use crate::receivers::dir::WorkItem;
use crate::work_queue::WorkQueue;

#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Directory holding archive files
    pub dir: PathBuf,
    /// Interval between two `close_all` passes
    pub flush_interval: Duration,
    /// Keep closed files on disk instead of replaying them
    pub archive_only: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/tailgate/archive"),
            flush_interval: Duration::from_secs(60),
            archive_only: false,
        }
    }
}

struct ArchiveWriter {
    file: File,
    closed: bool,
}

struct ArchiveFile {
    path: PathBuf,
    writer: Mutex<ArchiveWriter>,
}

impl ArchiveFile {
    fn lock(&self) -> MutexGuard<'_, ArchiveWriter> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ArchiveFile {
    fn drop(&mut self) {
        debug!(path = ?self.path, "Archive file released");
    }
}

pub struct FailedMessageArchive {
    config: ArchiveConfig,
    queue: WorkQueue,
    cache: Mutex<HashMap<String, Arc<ArchiveFile>>>,
}

impl FailedMessageArchive {
    pub fn new(config: ArchiveConfig, queue: WorkQueue) -> Self {
        Self {
            config,
            queue,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    pub fn archive_only(&self) -> bool {
        self.config.archive_only
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, Arc<ArchiveFile>>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append `message` and a newline to the topic's current archive file.
    pub fn archive_msg(&self, topic: &str, message: &[u8]) -> io::Result<()> {
        if topic.is_empty() || topic.contains(['/', '\\']) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid topic name {:?}", topic),
            ));
        }

        let mut record = Vec::with_capacity(message.len() + 1);
        record.extend_from_slice(message);
        record.push(b'\n');

        loop {
            let file = self.current_file(topic)?;
            let mut writer = file.lock();
            if writer.closed {
                // Lost a race with close_all; the cache now holds a new file.
                continue;
            }
            return writer.file.write_all(&record);
        }
    }

    /// Cached file of `topic`, opened by the first writer.
    fn current_file(&self, topic: &str) -> io::Result<Arc<ArchiveFile>> {
        let mut cache = self.cache();
        if let Some(file) = cache.get(topic) {
            return Ok(file.clone());
        }

        let (path, file) = self.create_file(topic)?;
        info!(topic, path = ?path, "Opened archive file");
        let file = Arc::new(ArchiveFile {
            path,
            writer: Mutex::new(ArchiveWriter {
                file,
                closed: false,
            }),
        });
        cache.insert(topic.to_string(), file.clone());
        Ok(file)
    }

    fn create_file(&self, topic: &str) -> io::Result<(PathBuf, File)> {
        fs::create_dir_all(&self.config.dir)?;

        let mut ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        loop {
            let path = self.config.dir.join(archive_file_name(topic, ts));
            match OpenOptions::new().append(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                // A file from the same second is still around, take the next name.
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => ts += 1,
                Err(e) => return Err(e),
            }
        }
    }

    /// Close every cached file. Closed files are queued for replay unless
    /// archive-only mode is set. Returns the closed paths.
    pub fn close_all(&self) -> Vec<PathBuf> {
        let files: Vec<(String, Arc<ArchiveFile>)> = self.cache().drain().collect();

        let mut closed = Vec::with_capacity(files.len());
        for (topic, file) in files {
            {
                let mut writer = file.lock();
                writer.closed = true;
                if let Err(e) = writer.file.sync_data() {
                    warn!(path = ?file.path, "Failed to sync archive file: {}", e);
                }
            }
            let path = file.path.clone();
            drop(file);

            debug!(topic = %topic, path = ?path, "Closed archive file");
            self.resubmit(&path);
            closed.push(path);
        }
        closed
    }

    /// Queue archive files left over from an earlier run. Returns the number
    /// of queued files.
    pub fn replay_leftovers(&self) -> io::Result<usize> {
        if self.config.archive_only || !self.config.dir.is_dir() {
            return Ok(0);
        }

        let open: Vec<PathBuf> = self.cache().values().map(|f| f.path.clone()).collect();
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.config.dir)? {
            let path = entry?.path();
            if path.is_file() && !open.contains(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut queued = 0;
        for path in paths {
            if self.resubmit(&path) {
                queued += 1;
            }
        }
        if queued > 0 {
            info!(queued, dir = ?self.config.dir, "Replaying leftover archive files");
        }
        Ok(queued)
    }

    fn resubmit(&self, path: &Path) -> bool {
        if self.config.archive_only {
            return false;
        }

        let Some((topic, _)) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_archive_file_name)
        else {
            warn!(path = ?path, "Not an archive file name, leaving it alone");
            return false;
        };

        self.queue.push(WorkItem::from_archive(topic, path));
        true
    }
}

fn archive_file_name(topic: &str, unix_secs: u64) -> String {
    format!("{}.{}", topic, unix_secs)
}

/// Split `<topic>.<unix-time>` into its parts.
pub fn parse_archive_file_name(name: &str) -> Option<(&str, u64)> {
    let (topic, ts) = name.rsplit_once('.')?;
    if topic.is_empty() || ts.is_empty() || !ts.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((topic, ts.parse().ok()?))
}

/// Runs `close_all` on a timer thread and once more at shutdown.
pub struct ArchiveFlusher {
    archive: Arc<FailedMessageArchive>,
    task: Option<PeriodicTask>,
}

impl ArchiveFlusher {
    pub fn new(archive: Arc<FailedMessageArchive>) -> Self {
        Self {
            archive,
            task: None,
        }
    }

    pub fn start(&mut self) -> io::Result<()> {
        if self.task.is_some() {
            return Ok(());
        }

        let archive = self.archive.clone();
        let interval = archive.config.flush_interval;
        let task = PeriodicTask::spawn("archive-flusher", interval, move || {
            let closed = archive.close_all();
            if !closed.is_empty() {
                info!(files = closed.len(), "Rotated archive files");
            }
        })?;

        info!(
            ?interval,
            dir = ?self.archive.dir(),
            archive_only = self.archive.archive_only(),
            "Archive flusher started"
        );
        self.task = Some(task);
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(mut task) = self.task.take() {
            task.stop();
            info!("Archive flusher stopped");
        }
    }
}

impl Drop for ArchiveFlusher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Log-and-continue wrapper for callers that cannot do anything about an
/// archive failure.
pub fn archive_or_log(archive: &FailedMessageArchive, topic: &str, message: &[u8]) -> bool {
    match archive.archive_msg(topic, message) {
        Ok(()) => true,
        Err(e) => {
            error!(topic, bytes = message.len(), "Failed to archive message, it is lost: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receivers::dir::ItemOrigin;
    use std::thread;
    use tempfile::TempDir;

    fn archive_in(dir: &Path, archive_only: bool) -> (Arc<FailedMessageArchive>, WorkQueue) {
        let queue = WorkQueue::new();
        let archive = Arc::new(FailedMessageArchive::new(
            ArchiveConfig {
                dir: dir.to_path_buf(),
                flush_interval: Duration::from_millis(20),
                archive_only,
            },
            queue.clone(),
        ));
        (archive, queue)
    }

    fn files_in(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        files.sort();
        files
    }

    #[test]
    fn test_parse_archive_file_name() {
        assert_eq!(parse_archive_file_name("topicA.1700000000"), Some(("topicA", 1700000000)));
        assert_eq!(parse_archive_file_name("a.b.12"), Some(("a.b", 12)));
        assert_eq!(parse_archive_file_name("topicA"), None);
        assert_eq!(parse_archive_file_name("topicA.12x"), None);
        assert_eq!(parse_archive_file_name(".12"), None);
        assert_eq!(parse_archive_file_name("t."), None);
    }

    #[test]
    fn test_appends_lines_to_one_file_per_topic() {
        let temp_dir = TempDir::new().unwrap();
        let (archive, _) = archive_in(temp_dir.path(), false);

        archive.archive_msg("a", b"one").unwrap();
        archive.archive_msg("a", b"two").unwrap();
        archive.archive_msg("b", b"three").unwrap();

        let files = files_in(temp_dir.path());
        assert_eq!(files.len(), 2);
        let a = files
            .iter()
            .find(|p| p.file_name().unwrap().to_str().unwrap().starts_with("a."))
            .unwrap();
        assert_eq!(fs::read_to_string(a).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn test_rejects_bad_topic() {
        let temp_dir = TempDir::new().unwrap();
        let (archive, _) = archive_in(temp_dir.path(), false);
        assert!(archive.archive_msg("", b"x").is_err());
        assert!(archive.archive_msg("../escape", b"x").is_err());
    }

    #[test]
    fn test_close_all_resubmits_closed_files() {
        let temp_dir = TempDir::new().unwrap();
        let (archive, queue) = archive_in(temp_dir.path(), false);

        archive.archive_msg("topicA", b"lost line").unwrap();
        let closed = archive.close_all();
        assert_eq!(closed.len(), 1);

        let item = queue.try_pop().unwrap();
        assert_eq!(item.topic, "topicA");
        assert_eq!(item.path, closed[0]);
        assert_eq!(item.origin, ItemOrigin::Archive);
        assert!(queue.is_empty());

        // The next message opens a new file.
        archive.archive_msg("topicA", b"again").unwrap();
        assert_eq!(files_in(temp_dir.path()).len(), 2);
    }

    #[test]
    fn test_archive_only_keeps_files() {
        let temp_dir = TempDir::new().unwrap();
        let (archive, queue) = archive_in(temp_dir.path(), true);

        archive.archive_msg("topicA", b"x").unwrap();
        assert_eq!(archive.close_all().len(), 1);
        assert!(queue.is_empty());
        assert_eq!(archive.replay_leftovers().unwrap(), 0);
        assert_eq!(files_in(temp_dir.path()).len(), 1);
    }

    #[test]
    fn test_replay_leftovers() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("topicA.100"), b"a\n").unwrap();
        fs::write(temp_dir.path().join("topicB.200"), b"b\n").unwrap();
        fs::write(temp_dir.path().join("README"), b"?").unwrap();
        let (archive, queue) = archive_in(temp_dir.path(), false);

        assert_eq!(archive.replay_leftovers().unwrap(), 2);
        let topics: Vec<String> = std::iter::from_fn(|| queue.try_pop())
            .map(|i| i.topic)
            .collect();
        assert_eq!(topics, vec!["topicA".to_string(), "topicB".to_string()]);
    }

    #[test]
    fn test_same_second_files_get_distinct_names() {
        let temp_dir = TempDir::new().unwrap();
        let (archive, _) = archive_in(temp_dir.path(), true);

        for _ in 0..3 {
            archive.archive_msg("t", b"x").unwrap();
            archive.close_all();
        }
        assert_eq!(files_in(temp_dir.path()).len(), 3);
    }

    #[test]
    fn test_concurrent_writers_and_close() {
        let temp_dir = TempDir::new().unwrap();
        let (archive, _) = archive_in(temp_dir.path(), true);

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let archive = archive.clone();
                thread::spawn(move || {
                    for i in 0..250 {
                        archive
                            .archive_msg("topicA", format!("w{}-{}", w, i).as_bytes())
                            .unwrap();
                    }
                })
            })
            .collect();
        let closer = {
            let archive = archive.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    archive.close_all();
                    thread::sleep(Duration::from_millis(1));
                }
            })
        };
        for w in writers {
            w.join().unwrap();
        }
        closer.join().unwrap();
        archive.close_all();

        let mut lines: Vec<String> = files_in(temp_dir.path())
            .iter()
            .flat_map(|p| {
                fs::read_to_string(p)
                    .unwrap()
                    .lines()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect();
        lines.sort();
        let mut expected: Vec<String> = (0..4)
            .flat_map(|w| (0..250).map(move |i| format!("w{}-{}", w, i)))
            .collect();
        expected.sort();
        assert_eq!(lines, expected);
    }

    #[test]
    fn test_handle_outlives_close() {
        let temp_dir = TempDir::new().unwrap();
        let (archive, _) = archive_in(temp_dir.path(), true);

        archive.archive_msg("t", b"first").unwrap();
        let held = archive.current_file("t").unwrap();
        archive.close_all();

        // A holder can still reach the file, but it is marked closed.
        assert!(held.lock().closed);
        assert_eq!(fs::read_to_string(&held.path).unwrap(), "first\n");
        archive.archive_msg("t", b"second").unwrap();
        assert_eq!(fs::read_to_string(&held.path).unwrap(), "first\n");
    }

    #[test]
    fn test_flusher_rotates_on_interval() {
        let temp_dir = TempDir::new().unwrap();
        let (archive, queue) = archive_in(temp_dir.path(), false);
        let mut flusher = ArchiveFlusher::new(archive.clone());
        flusher.start().unwrap();

        archive.archive_msg("topicA", b"x").unwrap();
        let item = queue.pop_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(item.topic, "topicA");
        flusher.stop();
    }
}
