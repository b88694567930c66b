// SPDX-License-Identifier: Apache-2.0

//! Directory watcher.
//!
//! Maps notifier subscriptions to `(topic, directory)` pairs and turns
//! directory events into work items:
//!
//! - a file moved in is delivered from the beginning
//! - a file closed after writing is delivered from where its last delivery
//!   ended, so appends are not sent twice
//! - a newly created file is recorded as the directory's latest file
//! - a new subdirectory is registered recursively
//! - a deleted directory drops its subscription and checkpoint
//!
//! Registering a directory runs a remedy pass that re-enqueues work lost
//! while the process was down: the checkpointed file is resumed at its
//! offset, and plain files changed before registration (and inside the
//! topic's remedy window, if it has one) are replayed.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, Metadata};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info, warn};

use crate::receivers::dir::checkpoint::CheckpointStore;
use crate::receivers::dir::config::DirReceiverConfig;
use crate::receivers::dir::error::{Error, Result};
use crate::receivers::dir::watcher::{DirEvent, DirEventKind, DirectoryNotifier, WatchHandle};
use crate::receivers::dir::work_item::{ReadFrom, WorkItem};
use crate::topic_config::{RemedyWindow, TopicConfig};
use crate::work_queue::WorkQueue;

/// A watched directory and the topic its files go to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    pub topic: String,
    pub dir: PathBuf,
}

#[derive(Default)]
struct WatchMaps {
    by_handle: HashMap<WatchHandle, WatchTarget>,
    by_path: HashMap<PathBuf, WatchHandle>,
}

impl WatchMaps {
    fn remove(&mut self, handle: WatchHandle) -> Option<WatchTarget> {
        let target = self.by_handle.remove(&handle)?;
        self.by_path.remove(&target.dir);
        Some(target)
    }
}

pub struct DirectoryWatcher {
    notifier: Arc<dyn DirectoryNotifier>,
    checkpoints: Arc<CheckpointStore>,
    queue: WorkQueue,
    config: DirReceiverConfig,
    maps: Mutex<WatchMaps>,
    running: AtomicBool,
    thread: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl DirectoryWatcher {
    pub fn new(
        notifier: Arc<dyn DirectoryNotifier>,
        checkpoints: Arc<CheckpointStore>,
        queue: WorkQueue,
        config: DirReceiverConfig,
    ) -> Self {
        Self {
            notifier,
            checkpoints,
            queue,
            config,
            maps: Mutex::new(WatchMaps::default()),
            running: AtomicBool::new(false),
            thread: Mutex::new(None),
        }
    }

    fn maps(&self) -> MutexGuard<'_, WatchMaps> {
        self.maps.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register every directory of a topic.
    ///
    /// A directory that fails is logged and skipped; the first failure is
    /// returned after all directories have been tried.
    pub fn add_watch_topic(&self, topic: &TopicConfig) -> Result<()> {
        let window = topic.remedy_window();
        let mut first_err = None;
        for dir in topic.directories() {
            if let Err(e) = self.add_watch_path(topic.topic(), dir, window) {
                warn!(topic = topic.topic(), dir = ?dir, "Failed to watch directory: {}", e);
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Register `dir` and every subdirectory below it for `topic`.
    ///
    /// Errors on `dir` itself are returned. Subdirectories that cannot be
    /// registered are logged and skipped.
    pub fn add_watch_path(&self, topic: &str, dir: &Path, window: RemedyWindow) -> Result<()> {
        if topic.is_empty() {
            return Err(Error::InvalidWatch("topic must not be empty".into()));
        }
        if dir.as_os_str().is_empty() {
            return Err(Error::InvalidWatch("directory must not be empty".into()));
        }

        let root = normalize(dir)?;
        let mut pending = VecDeque::new();
        self.register(topic, &root, window, &mut pending)?;

        while let Some(sub) = pending.pop_front() {
            if let Err(e) = self.register(topic, &sub, window, &mut pending) {
                warn!(topic, dir = ?sub, "Failed to watch subdirectory: {}", e);
            }
        }
        Ok(())
    }

    /// Subscribe one directory and run its remedy pass. Subdirectories found
    /// during the pass are appended to `pending`.
    fn register(
        &self,
        topic: &str,
        dir: &Path,
        window: RemedyWindow,
        pending: &mut VecDeque<PathBuf>,
    ) -> Result<()> {
        if !dir.is_dir() {
            return Err(Error::NotADirectory(dir.to_path_buf()));
        }
        if self.maps().by_path.contains_key(dir) {
            return Err(Error::AlreadyWatched(dir.to_path_buf()));
        }

        self.wait_until_settled(dir)?;

        let handle = self.notifier.watch(dir)?;
        let registered_at = SystemTime::now();
        {
            let mut maps = self.maps();
            if maps.by_handle.contains_key(&handle) {
                return Err(Error::AlreadyWatched(dir.to_path_buf()));
            }
            maps.by_handle.insert(
                handle,
                WatchTarget {
                    topic: topic.to_string(),
                    dir: dir.to_path_buf(),
                },
            );
            maps.by_path.insert(dir.to_path_buf(), handle);
        }
        info!(topic, dir = ?dir, %handle, remedy = %window, "Watching directory");

        let queued = self.remedy(topic, dir, window, registered_at, pending)?;
        if queued > 0 {
            info!(topic, dir = ?dir, queued, "Remedy queued files");
        }
        Ok(())
    }

    /// Block until the directory's mtime is at least `settle_age` old, so a
    /// directory still being populated is not subscribed half-way.
    fn wait_until_settled(&self, dir: &Path) -> Result<()> {
        loop {
            let mtime = fs::metadata(dir)?.modified()?;
            let age = match SystemTime::now().duration_since(mtime) {
                Ok(age) => age,
                Err(_) => {
                    debug!(dir = ?dir, "Directory mtime is in the future, not waiting");
                    return Ok(());
                }
            };
            if age >= self.config.settle_age {
                return Ok(());
            }
            debug!(dir = ?dir, ?age, "Waiting for directory to settle");
            thread::sleep(self.config.settle_poll.max(Duration::from_millis(1)));
        }
    }

    /// Enqueue work lost while nobody was watching `dir`. Returns the number
    /// of queued items.
    fn remedy(
        &self,
        topic: &str,
        dir: &Path,
        window: RemedyWindow,
        registered_at: SystemTime,
        pending: &mut VecDeque<PathBuf>,
    ) -> Result<usize> {
        let mut queued = 0;

        // Files not newer than the checkpointed one were already handled.
        let mut lower_bound = None;
        if let Some(cp) = self.checkpoints.get(dir) {
            let path = dir.join(&cp.file);
            lower_bound = fs::metadata(&path).ok().map(|m| change_time(&m));
            debug!(topic, path = ?path, offset = cp.offset, "Resuming checkpointed file");
            self.queue
                .push(WorkItem::new(topic, path, ReadFrom::at(cp.offset)));
            queued += 1;
        }

        let cutoff = window.cutoff(SystemTime::now());
        for (path, meta) in list_entries(dir)? {
            if meta.is_dir() {
                pending.push_back(path);
                continue;
            }
            if !meta.is_file() {
                continue;
            }

            let Some(cutoff) = cutoff else {
                continue;
            };
            let changed = change_time(&meta);
            if changed < cutoff || changed >= registered_at {
                continue;
            }
            if lower_bound.is_some_and(|lb| changed <= lb) {
                continue;
            }

            debug!(topic, path = ?path, "Replaying file");
            self.queue
                .push(WorkItem::new(topic, path, ReadFrom::Beginning));
            queued += 1;
        }

        Ok(queued)
    }

    /// Unsubscribe every directory registered for `topic`. Returns the number
    /// of removed subscriptions.
    pub fn remove_watch_topic(&self, topic: &str) -> usize {
        let removed: Vec<(WatchHandle, WatchTarget)> = {
            let mut maps = self.maps();
            let handles: Vec<WatchHandle> = maps
                .by_handle
                .iter()
                .filter(|(_, t)| t.topic == topic)
                .map(|(h, _)| *h)
                .collect();
            handles
                .into_iter()
                .filter_map(|h| maps.remove(h).map(|t| (h, t)))
                .collect()
        };

        for (handle, target) in &removed {
            if let Err(e) = self.notifier.unwatch(*handle) {
                warn!(topic, dir = ?target.dir, "Failed to unwatch directory: {}", e);
            }
        }
        if !removed.is_empty() {
            info!(topic, directories = removed.len(), "Stopped watching topic");
        }
        removed.len()
    }

    /// Directories currently watched for `topic`, sorted.
    pub fn watched_dirs(&self, topic: &str) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self
            .maps()
            .by_handle
            .values()
            .filter(|t| t.topic == topic)
            .map(|t| t.dir.clone())
            .collect();
        dirs.sort();
        dirs
    }

    pub fn target(&self, handle: WatchHandle) -> Option<WatchTarget> {
        self.maps().by_handle.get(&handle).cloned()
    }

    /// Start the event loop on its own thread.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.thread.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Ok(());
        }

        self.running.store(true, Ordering::SeqCst);
        let watcher = self.clone();
        let handle = thread::Builder::new()
            .name("dir-watcher".to_string())
            .spawn(move || watcher.run())?;
        *slot = Some(handle);

        info!(backend = self.notifier.backend_name(), "Directory watcher started");
        Ok(())
    }

    /// True when the event loop was started and has exited on its own.
    pub fn has_failed(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self
                .thread
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .as_ref()
                .is_some_and(|h| h.is_finished())
    }

    /// Stop the event loop and wait for it to exit. Returns the loop's error
    /// if it had stopped on its own.
    pub fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.notifier.wake();

        let handle = self
            .thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(handle) = handle else {
            return Ok(());
        };

        let result = match handle.join() {
            Ok(result) => result,
            Err(_) => {
                error!("Directory watcher thread panicked");
                Ok(())
            }
        };
        info!("Directory watcher stopped");
        result
    }

    fn run(&self) -> Result<()> {
        debug!(wait = ?self.config.event_wait, "Directory event loop running");
        while self.running.load(Ordering::SeqCst) {
            let events = match self.notifier.recv_timeout(self.config.event_wait) {
                Ok(events) => events,
                Err(e) => {
                    error!("Directory notifier failed, stopping event loop: {}", e);
                    return Err(e.into());
                }
            };

            for event in events {
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                self.handle_event(event);
            }
        }
        Ok(())
    }

    fn handle_event(&self, event: DirEvent) {
        if event.kind == DirEventKind::Invalidated {
            match self.maps().remove(event.handle) {
                Some(target) => {
                    self.checkpoints.remove(&target.dir);
                    info!(topic = %target.topic, dir = ?target.dir, "Watched directory removed");
                }
                None => debug!(handle = %event.handle, "Invalidation for unknown handle"),
            }
            return;
        }

        let Some(target) = self.target(event.handle) else {
            debug!(handle = %event.handle, "Event for unknown handle");
            return;
        };

        match event.kind {
            DirEventKind::SubdirCreated(name) => {
                let path = target.dir.join(name);
                if let Err(e) =
                    self.add_watch_path(&target.topic, &path, RemedyWindow::BeforeRegistration)
                {
                    warn!(topic = %target.topic, dir = ?path, "Failed to watch new subdirectory: {}", e);
                }
            }
            DirEventKind::FileCreated(name) => {
                if is_hidden(&name) {
                    return;
                }
                self.queue.push(WorkItem::new(
                    &target.topic,
                    target.dir.join(name),
                    ReadFrom::MarkOnly,
                ));
            }
            DirEventKind::FileArrived(name) => {
                if is_hidden(&name) {
                    return;
                }
                let path = target.dir.join(name);
                debug!(topic = %target.topic, path = ?path, "File arrived");
                self.queue
                    .push(WorkItem::new(&target.topic, path, ReadFrom::Beginning));
            }
            DirEventKind::FileWritten(name) => {
                if is_hidden(&name) {
                    return;
                }
                let path = target.dir.join(name);
                debug!(topic = %target.topic, path = ?path, "File written");
                self.queue
                    .push(WorkItem::new(&target.topic, path, ReadFrom::Continue));
            }
            DirEventKind::Other(desc) => {
                debug!(dir = ?target.dir, event = %desc, "Ignoring directory event");
            }
            DirEventKind::Invalidated => {}
        }
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.as_encoded_bytes().first() == Some(&b'.')
}

/// Directory entries, sorted by name, without hidden entries.
fn list_entries(dir: &Path) -> Result<Vec<(PathBuf, Metadata)>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if is_hidden(&entry.file_name()) {
            continue;
        }
        // Entries can vanish between listing and stat.
        match fs::metadata(entry.path()) {
            Ok(meta) => entries.push((entry.path(), meta)),
            Err(e) => debug!(path = ?entry.path(), "Skipping entry: {}", e),
        }
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

/// Absolute, lexically normalized form of `dir`.
fn normalize(dir: &Path) -> Result<PathBuf> {
    let absolute = if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        std::env::current_dir()?.join(dir)
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    Ok(out)
}

/// Inode change time, the timestamp remedy orders files by.
#[cfg(unix)]
pub(crate) fn change_time(meta: &Metadata) -> SystemTime {
    use std::os::unix::fs::MetadataExt;
    let secs = meta.ctime().max(0) as u64;
    let nanos = meta.ctime_nsec().clamp(0, 999_999_999) as u32;
    UNIX_EPOCH + Duration::new(secs, nanos)
}

#[cfg(not(unix))]
pub(crate) fn change_time(meta: &Metadata) -> SystemTime {
    meta.modified().unwrap_or(UNIX_EPOCH)
}
