// SPDX-License-Identifier: Apache-2.0

//! Unbounded blocking FIFO shared by the directory watcher, the archive
//! flusher and the delivery workers.

use flume::{Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use crate::receivers::dir::WorkItem;

/// Multi-producer, multi-consumer work queue.
///
/// Every pushed item is handed to exactly one consumer. There is no ordering
/// guarantee between items produced by different directories.
pub struct WorkQueue<T = WorkItem> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    /// Enqueue an item, waking one waiting consumer.
    pub fn push(&self, item: T) {
        // Both halves live in self, so the channel cannot be disconnected here.
        let _ = self.tx.send(item);
    }

    /// Blocking pop - blocks until an item is available.
    pub fn wait_pop(&self) -> T {
        loop {
            if let Ok(item) = self.rx.recv() {
                return item;
            }
        }
    }

    /// Non-blocking pop. Returns None if the queue is empty.
    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Blocking pop with timeout. Returns None if the timeout expires first.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
