// SPDX-License-Identifier: Apache-2.0

//! Periodic persistence of the checkpoint table.
//!
//! A failed save is logged and retried on the next interval. It never stops
//! the process; it only widens the replay window after a crash.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::periodic::PeriodicTask;
use crate::receivers::dir::checkpoint::CheckpointStore;
use crate::receivers::dir::error::Result;

/// Saves a `CheckpointStore` on a timer thread and once more at shutdown.
pub struct CheckpointPersister {
    store: Arc<CheckpointStore>,
    interval: Duration,
    task: Option<PeriodicTask>,
}

impl CheckpointPersister {
    pub fn new(store: Arc<CheckpointStore>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            task: None,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.task.is_some() {
            return Ok(());
        }

        let store = self.store.clone();
        let mut first_failure: Option<Instant> = None;
        let task = PeriodicTask::spawn("checkpoint-persister", self.interval, move || {
            match store.save() {
                Ok(()) => {
                    if let Some(since) = first_failure.take() {
                        info!(failing_for = ?since.elapsed(), "Checkpoint save recovered");
                    }
                }
                Err(e) => match first_failure {
                    None => {
                        first_failure = Some(Instant::now());
                        warn!("Failed to save checkpoints, will retry: {}", e);
                    }
                    Some(since) => {
                        error!(
                            failing_for = ?since.elapsed(),
                            "Checkpoint save still failing, will retry: {}", e
                        );
                    }
                },
            }
        })?;

        info!(interval = ?self.interval, path = ?self.store.path(), "Checkpoint persister started");
        self.task = Some(task);
        Ok(())
    }

    /// Stop the timer; performs one final save.
    pub fn stop(&mut self) {
        if let Some(mut task) = self.task.take() {
            task.stop();
            info!("Checkpoint persister stopped");
        }
    }
}

impl Drop for CheckpointPersister {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    #[test]
    fn test_saves_periodically() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("checkpoints");
        let store = Arc::new(CheckpointStore::new(&path));
        store.update(Path::new("/d"), "f.log", 3).unwrap();

        let mut persister = CheckpointPersister::new(store.clone(), Duration::from_millis(20));
        persister.start().unwrap();
        std::thread::sleep(Duration::from_millis(100));

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "/d/f.log:3\n");
        persister.stop();
    }

    #[test]
    fn test_final_save_on_stop() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("checkpoints");
        let store = Arc::new(CheckpointStore::new(&path));

        let mut persister = CheckpointPersister::new(store.clone(), Duration::from_secs(3600));
        persister.start().unwrap();
        store.update(Path::new("/d"), "f.log", 9).unwrap();
        persister.stop();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "/d/f.log:9\n");
    }

    #[test]
    fn test_save_failure_is_not_fatal() {
        let temp_dir = TempDir::new().unwrap();
        // A directory where the checkpoint file should be makes rename fail.
        let path = temp_dir.path().join("checkpoints");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupied"), b"x").unwrap();
        let store = Arc::new(CheckpointStore::new(&path));
        store.update(Path::new("/d"), "f.log", 1).unwrap();

        let mut persister = CheckpointPersister::new(store, Duration::from_millis(10));
        persister.start().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        persister.stop();
    }
}
