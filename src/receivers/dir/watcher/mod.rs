// SPDX-License-Identifier: Apache-2.0

//! Directory notification backends for the directory receiver.
//!
//! The receiver only talks to the `DirectoryNotifier` trait. The production
//! backend is `NativeNotifier`, built on OS-level notifications (inotify on
//! Linux). There is no polling fallback: if the notifier cannot be created,
//! no new files can be discovered and the receiver fails to start.

#[cfg(test)]
mod mock;
mod native;
mod traits;

#[cfg(test)]
pub use mock::MockNotifier;
pub use native::NativeNotifier;
pub use traits::{DirEvent, DirEventKind, DirectoryNotifier, WatchHandle, WatcherError};
