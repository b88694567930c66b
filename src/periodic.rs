// SPDX-License-Identifier: Apache-2.0

//! Timer threads that run a closure on an interval and once more on stop.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::RecvTimeoutError;
use tracing::{debug, error};

/// A named OS thread calling `tick` every `interval`.
///
/// `stop` wakes the thread immediately, runs `tick` one final time and joins.
pub struct PeriodicTask {
    name: &'static str,
    running: Arc<AtomicBool>,
    stop_tx: Option<flume::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn spawn<F>(name: &'static str, interval: Duration, mut tick: F) -> io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = flume::bounded::<()>(1);

        let thread_running = running.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!(task = name, ?interval, "Periodic task started");
                while thread_running.load(Ordering::SeqCst) {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => tick(),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                // Final run on shutdown
                tick();
                debug!(task = name, "Periodic task stopped");
            })?;

        Ok(Self {
            name,
            running,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Stop the thread and wait for the final tick to finish.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        drop(self.stop_tx.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(task = self.name, "Periodic task panicked");
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn ticks_periodically_and_once_on_stop() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut task = PeriodicTask::spawn("test-tick", Duration::from_millis(20), move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        thread::sleep(Duration::from_millis(110));
        let before_stop = count.load(Ordering::SeqCst);
        assert!(before_stop >= 2, "expected periodic ticks, got {}", before_stop);

        task.stop();
        assert!(!task.is_running());
        assert!(count.load(Ordering::SeqCst) > before_stop);
    }

    #[test]
    fn stop_is_not_delayed_by_long_interval() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut task = PeriodicTask::spawn("test-slow", Duration::from_secs(3600), move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let start = Instant::now();
        task.stop();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
