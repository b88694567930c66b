// SPDX-License-Identifier: Apache-2.0

//! Traits and types for directory notifiers.

use std::ffi::OsString;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Error type for notifier operations
#[derive(Debug)]
pub enum WatcherError {
    /// Failed to initialize the notifier
    Init(String),
    /// Failed to watch or unwatch a path
    Watch(String),
    /// Handle is not registered with the notifier
    UnknownHandle(WatchHandle),
    /// IO error
    Io(std::io::Error),
    /// The notification channel is gone; no further events can arrive
    Channel(String),
}

impl fmt::Display for WatcherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatcherError::Init(msg) => write!(f, "notifier initialization failed: {}", msg),
            WatcherError::Watch(msg) => write!(f, "watch failed: {}", msg),
            WatcherError::UnknownHandle(h) => write!(f, "unknown watch handle {}", h),
            WatcherError::Io(e) => write!(f, "IO error: {}", e),
            WatcherError::Channel(msg) => write!(f, "channel error: {}", msg),
        }
    }
}

impl std::error::Error for WatcherError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatcherError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for WatcherError {
    fn from(e: std::io::Error) -> Self {
        WatcherError::Io(e)
    }
}

/// Opaque token identifying one registered directory subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchHandle(pub u64);

impl fmt::Display for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wd{}", self.0)
    }
}

/// What happened inside (or to) a watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirEventKind {
    /// A subdirectory was created or moved in.
    SubdirCreated(OsString),
    /// A regular file was created and may still be written to.
    FileCreated(OsString),
    /// A regular file was moved in, complete.
    FileArrived(OsString),
    /// A regular file was closed after writing. It may have been written
    /// before, so only the new tail is unread.
    FileWritten(OsString),
    /// The watched directory itself is gone; the handle is dead.
    Invalidated,
    /// Anything the receiver does not act on.
    Other(String),
}

/// A directory event, addressed by watch handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEvent {
    pub handle: WatchHandle,
    pub kind: DirEventKind,
}

impl DirEvent {
    pub fn new(handle: WatchHandle, kind: DirEventKind) -> Self {
        Self { handle, kind }
    }

    pub fn file_created(handle: WatchHandle, name: impl Into<OsString>) -> Self {
        Self::new(handle, DirEventKind::FileCreated(name.into()))
    }

    pub fn file_arrived(handle: WatchHandle, name: impl Into<OsString>) -> Self {
        Self::new(handle, DirEventKind::FileArrived(name.into()))
    }

    pub fn file_written(handle: WatchHandle, name: impl Into<OsString>) -> Self {
        Self::new(handle, DirEventKind::FileWritten(name.into()))
    }

    pub fn subdir_created(handle: WatchHandle, name: impl Into<OsString>) -> Self {
        Self::new(handle, DirEventKind::SubdirCreated(name.into()))
    }

    pub fn invalidated(handle: WatchHandle) -> Self {
        Self::new(handle, DirEventKind::Invalidated)
    }
}

/// Directory-change notification subsystem.
///
/// Implementations must be usable from several threads: the event loop blocks
/// in `recv_timeout` while other threads add and remove watches.
pub trait DirectoryNotifier: Send + Sync {
    /// Subscribe to create, moved-in, close-after-write and self-delete events
    /// of one directory (non-recursive).
    ///
    /// Watching a directory that is already watched returns the existing handle.
    fn watch(&self, dir: &Path) -> Result<WatchHandle, WatcherError>;

    /// Remove a subscription.
    fn unwatch(&self, handle: WatchHandle) -> Result<(), WatcherError>;

    /// Wait for the next batch of events.
    ///
    /// Returns an empty vector when the timeout expires or after `wake`.
    /// An error means the notification channel failed persistently.
    fn recv_timeout(&self, timeout: Duration) -> Result<Vec<DirEvent>, WatcherError>;

    /// Interrupt a blocked `recv_timeout`.
    fn wake(&self);

    /// Get the name of the notifier backend for logging.
    fn backend_name(&self) -> &'static str;
}
