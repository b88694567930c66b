// SPDX-License-Identifier: Apache-2.0

//! Native directory notifier using the `notify` crate.
//!
//! Uses OS-level file system notifications:
//! - Linux: inotify
//! - macOS: FSEvents
//! - Windows: ReadDirectoryChangesW
//!
//! `notify` addresses watches by path; this type issues a `WatchHandle` per
//! watched directory and translates event paths back to handles.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError, channel};
use std::sync::Mutex;
use std::time::Duration;

use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use super::traits::{DirEvent, DirEventKind, DirectoryNotifier, WatchHandle, WatcherError};

enum Message {
    Event(notify::Result<Event>),
    Wake,
}

#[derive(Default)]
struct HandleTable {
    by_path: HashMap<PathBuf, WatchHandle>,
    by_handle: HashMap<WatchHandle, PathBuf>,
}

impl HandleTable {
    fn remove_handle(&mut self, handle: WatchHandle) -> Option<PathBuf> {
        let path = self.by_handle.remove(&handle)?;
        self.by_path.remove(&path);
        Some(path)
    }
}

/// Native directory notifier using OS-level notifications.
pub struct NativeNotifier {
    watcher: Mutex<RecommendedWatcher>,
    receiver: Mutex<Receiver<Message>>,
    waker: Mutex<Sender<Message>>,
    table: Mutex<HandleTable>,
    next_handle: AtomicU64,
}

impl NativeNotifier {
    pub fn new() -> Result<Self, WatcherError> {
        let (tx, rx) = channel();
        let event_tx = tx.clone();

        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = event_tx.send(Message::Event(res));
            },
            Config::default(),
        )
        .map_err(|e| WatcherError::Init(e.to_string()))?;

        Ok(Self {
            watcher: Mutex::new(watcher),
            receiver: Mutex::new(rx),
            waker: Mutex::new(tx),
            table: Mutex::new(HandleTable::default()),
            next_handle: AtomicU64::new(1),
        })
    }

    /// Convert a notify event into directory events
    fn convert_event(&self, event: Event) -> Vec<DirEvent> {
        let mut table = match self.table.lock() {
            Ok(t) => t,
            Err(e) => e.into_inner(),
        };

        let mut out = Vec::new();
        for path in &event.paths {
            // The watched directory itself disappeared.
            if matches!(event.kind, EventKind::Remove(_)) {
                if let Some(handle) = table.by_path.get(path).copied() {
                    table.remove_handle(handle);
                    out.push(DirEvent::invalidated(handle));
                    continue;
                }
            }

            let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
                continue;
            };
            let Some(handle) = table.by_path.get(parent).copied() else {
                continue;
            };

            let kind = match event.kind {
                EventKind::Create(CreateKind::Folder) => {
                    Some(DirEventKind::SubdirCreated(name.to_owned()))
                }
                EventKind::Create(CreateKind::Any) | EventKind::Create(CreateKind::Other)
                    if path.is_dir() =>
                {
                    Some(DirEventKind::SubdirCreated(name.to_owned()))
                }
                EventKind::Create(_) => Some(DirEventKind::FileCreated(name.to_owned())),
                EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                    if path.is_dir() {
                        Some(DirEventKind::SubdirCreated(name.to_owned()))
                    } else {
                        Some(DirEventKind::FileArrived(name.to_owned()))
                    }
                }
                EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
                    Some(DirEventKind::FileWritten(name.to_owned()))
                }
                EventKind::Modify(_) | EventKind::Access(_) | EventKind::Remove(_) => None,
                other => Some(DirEventKind::Other(format!("{:?}", other))),
            };

            if let Some(kind) = kind {
                out.push(DirEvent::new(handle, kind));
            }
        }

        if event.need_rescan() {
            warn!("Notifier reported dropped events, some files may need a restart to be found");
        }

        out
    }

    fn handle_message(&self, msg: Message, events: &mut Vec<DirEvent>) {
        match msg {
            Message::Event(Ok(event)) => events.extend(self.convert_event(event)),
            Message::Event(Err(e)) => {
                warn!("Directory notifier error: {}", e);
            }
            Message::Wake => {}
        }
    }
}

impl DirectoryNotifier for NativeNotifier {
    fn watch(&self, dir: &Path) -> Result<WatchHandle, WatcherError> {
        let mut table = self
            .table
            .lock()
            .map_err(|e| WatcherError::Watch(format!("mutex poisoned: {}", e)))?;

        if let Some(handle) = table.by_path.get(dir) {
            return Ok(*handle);
        }

        self.watcher
            .lock()
            .map_err(|e| WatcherError::Watch(format!("mutex poisoned: {}", e)))?
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| WatcherError::Watch(e.to_string()))?;

        let handle = WatchHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        table.by_path.insert(dir.to_path_buf(), handle);
        table.by_handle.insert(handle, dir.to_path_buf());
        debug!(%handle, path = ?dir, "Registered directory watch");

        Ok(handle)
    }

    fn unwatch(&self, handle: WatchHandle) -> Result<(), WatcherError> {
        let path = self
            .table
            .lock()
            .map_err(|e| WatcherError::Watch(format!("mutex poisoned: {}", e)))?
            .remove_handle(handle)
            .ok_or(WatcherError::UnknownHandle(handle))?;

        self.watcher
            .lock()
            .map_err(|e| WatcherError::Watch(format!("mutex poisoned: {}", e)))?
            .unwatch(&path)
            .map_err(|e| WatcherError::Watch(e.to_string()))
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Vec<DirEvent>, WatcherError> {
        let mut events = Vec::new();

        let receiver = self
            .receiver
            .lock()
            .map_err(|e| WatcherError::Channel(format!("mutex poisoned: {}", e)))?;

        // First wait for at least one message with timeout
        match receiver.recv_timeout(timeout) {
            Ok(msg) => self.handle_message(msg, &mut events),
            Err(RecvTimeoutError::Timeout) => return Ok(events),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(WatcherError::Channel("notifier channel disconnected".into()));
            }
        }

        // Then drain any additional pending messages
        loop {
            match receiver.try_recv() {
                Ok(msg) => self.handle_message(msg, &mut events),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    return Err(WatcherError::Channel("notifier channel disconnected".into()));
                }
            }
        }

        Ok(events)
    }

    fn wake(&self) {
        if let Ok(tx) = self.waker.lock() {
            let _ = tx.send(Message::Wake);
        }
    }

    fn backend_name(&self) -> &'static str {
        #[cfg(target_os = "linux")]
        {
            "inotify"
        }
        #[cfg(target_os = "macos")]
        {
            "FSEvents"
        }
        #[cfg(target_os = "windows")]
        {
            "ReadDirectoryChangesW"
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        {
            "native"
        }
    }
}
