// SPDX-License-Identifier: Apache-2.0

//! Directory receiver for spooled log files.
//!
//! This receiver watches directory trees, one topic per tree, and turns
//! finished files into work items for the delivery workers.
//!
//! Features:
//! - Recursive registration of subdirectories, including ones created later
//! - Per-directory offset checkpoints for resume after restarts
//! - Remedy pass that recovers files written while the process was down

pub mod checkpoint;
pub mod checkpoint_persister;
pub mod config;
pub mod directory_watcher;
pub mod error;
pub mod watcher;
pub mod work_item;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use checkpoint_persister::CheckpointPersister;
pub use config::DirReceiverConfig;
pub use directory_watcher::{DirectoryWatcher, WatchTarget};
pub use error::{Error, Result};
pub use watcher::{DirEvent, DirEventKind, DirectoryNotifier, NativeNotifier, WatchHandle};
pub use work_item::{ItemOrigin, ReadFrom, WorkItem};
