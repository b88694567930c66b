// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::path::{Path, PathBuf};

/// Where a delivery worker starts reading a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFrom {
    /// Bookkeeping only: record the file in the checkpoint store without
    /// reading any content.
    MarkOnly,
    /// Read the whole file.
    Beginning,
    /// Resume at a byte offset.
    Offset(u64),
    /// Read what was appended since this file was last delivered: the
    /// worker resumes after the last byte it handed to the producer, or at
    /// the directory checkpoint when that names the file, or at 0.
    Continue,
}

impl ReadFrom {
    /// Map a byte offset to a start position; offset 0 means the beginning.
    pub fn at(offset: u64) -> Self {
        if offset == 0 {
            ReadFrom::Beginning
        } else {
            ReadFrom::Offset(offset)
        }
    }

    /// Signed representation: -1 for mark-only, -2 for continue, otherwise
    /// the byte offset.
    pub fn as_i64(&self) -> i64 {
        match self {
            ReadFrom::MarkOnly => -1,
            ReadFrom::Continue => -2,
            ReadFrom::Beginning => 0,
            ReadFrom::Offset(o) => *o as i64,
        }
    }
}

/// Who produced a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOrigin {
    /// A watched directory, either through a live event or the remedy pass.
    Watch,
    /// A rotated failed-message archive file being replayed.
    Archive,
}

/// A unit of delivery work: forward `path` to `topic` starting at `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub topic: String,
    pub path: PathBuf,
    pub start: ReadFrom,
    pub origin: ItemOrigin,
}

impl WorkItem {
    pub fn new(topic: impl Into<String>, path: impl Into<PathBuf>, start: ReadFrom) -> Self {
        Self {
            topic: topic.into(),
            path: path.into(),
            start,
            origin: ItemOrigin::Watch,
        }
    }

    pub fn from_archive(topic: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            topic: topic.into(),
            path: path.into(),
            start: ReadFrom::Beginning,
            origin: ItemOrigin::Archive,
        }
    }

    /// Directory the item's checkpoint is kept under.
    pub fn directory(&self) -> Option<&Path> {
        self.path.parent()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.topic,
            self.path.display(),
            self.start.as_i64()
        )
    }
}
