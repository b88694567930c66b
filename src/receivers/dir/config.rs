// SPDX-License-Identifier: Apache-2.0

//! Configuration for the directory receiver.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the directory watcher and its checkpoint persister
#[derive(Debug, Clone)]
pub struct DirReceiverConfig {
    /// Path of the checkpoint file
    pub checkpoint_path: PathBuf,
    /// Interval between checkpoint saves
    pub checkpoint_interval: Duration,
    /// Minimum age of a directory's mtime before it is subscribed
    pub settle_age: Duration,
    /// Granularity of the settle wait
    pub settle_poll: Duration,
    /// Upper bound on a single notifier wait, for liveness
    pub event_wait: Duration,
}

impl Default for DirReceiverConfig {
    fn default() -> Self {
        Self {
            checkpoint_path: PathBuf::from("/var/lib/tailgate/checkpoints"),
            checkpoint_interval: Duration::from_secs(5),
            settle_age: Duration::from_secs(3),
            settle_poll: Duration::from_secs(1),
            event_wait: Duration::from_secs(120),
        }
    }
}

impl DirReceiverConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.checkpoint_path.as_os_str().is_empty() {
            return Err("A checkpoint path must be specified".to_string());
        }

        if self.checkpoint_interval.is_zero() {
            return Err("Checkpoint interval must be greater than zero".to_string());
        }

        if self.event_wait.is_zero() {
            return Err("Event wait must be greater than zero".to_string());
        }

        Ok(())
    }
}
