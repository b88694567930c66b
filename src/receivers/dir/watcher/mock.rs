// SPDX-License-Identifier: Apache-2.0

//! Scriptable notifier for tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use super::traits::{DirEvent, DirectoryNotifier, WatchHandle, WatcherError};

/// Notifier whose events are injected by the test.
pub struct MockNotifier {
    next_handle: AtomicU64,
    watched: Mutex<HashMap<PathBuf, WatchHandle>>,
    unwatched: Mutex<Vec<WatchHandle>>,
    failing: Mutex<HashSet<PathBuf>>,
    broken: AtomicBool,
    tx: flume::Sender<Option<DirEvent>>,
    rx: flume::Receiver<Option<DirEvent>>,
}

impl MockNotifier {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            next_handle: AtomicU64::new(1),
            watched: Mutex::new(HashMap::new()),
            unwatched: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            broken: AtomicBool::new(false),
            tx,
            rx,
        }
    }

    /// Queue an event for the next `recv_timeout`.
    pub fn inject(&self, event: DirEvent) {
        let _ = self.tx.send(Some(event));
    }

    /// Make `watch` fail for this path.
    pub fn fail_watch(&self, path: impl Into<PathBuf>) {
        self.failing.lock().unwrap().insert(path.into());
    }

    /// Make every following `recv_timeout` fail as if the channel broke.
    pub fn break_channel(&self) {
        self.broken.store(true, Ordering::SeqCst);
        self.wake();
    }

    pub fn handle_for(&self, path: &Path) -> Option<WatchHandle> {
        self.watched.lock().unwrap().get(path).copied()
    }

    pub fn watched_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.watched.lock().unwrap().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn unwatched(&self) -> Vec<WatchHandle> {
        self.unwatched.lock().unwrap().clone()
    }
}

impl DirectoryNotifier for MockNotifier {
    fn watch(&self, dir: &Path) -> Result<WatchHandle, WatcherError> {
        if self.failing.lock().unwrap().contains(dir) {
            return Err(WatcherError::Watch(format!("refused {}", dir.display())));
        }
        let mut watched = self.watched.lock().unwrap();
        if let Some(h) = watched.get(dir) {
            return Ok(*h);
        }
        let handle = WatchHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        watched.insert(dir.to_path_buf(), handle);
        Ok(handle)
    }

    fn unwatch(&self, handle: WatchHandle) -> Result<(), WatcherError> {
        let mut watched = self.watched.lock().unwrap();
        let before = watched.len();
        watched.retain(|_, h| *h != handle);
        if watched.len() == before {
            return Err(WatcherError::UnknownHandle(handle));
        }
        self.unwatched.lock().unwrap().push(handle);
        Ok(())
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Vec<DirEvent>, WatcherError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(WatcherError::Channel("mock channel broken".into()));
        }

        let mut events = Vec::new();
        match self.rx.recv_timeout(timeout) {
            Ok(Some(ev)) => events.push(ev),
            Ok(None) | Err(_) => return Ok(events),
        }
        while let Ok(Some(ev)) = self.rx.try_recv() {
            events.push(ev);
        }
        Ok(events)
    }

    fn wake(&self) {
        let _ = self.tx.send(None);
    }

    fn backend_name(&self) -> &'static str {
        "mock"
    }
}
