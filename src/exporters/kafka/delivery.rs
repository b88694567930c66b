// SPDX-License-Identifier: Apache-2.0

//! Delivery workers.
//!
//! Each worker takes a work item off the queue and streams the file from its
//! start position to the topic's producer, one newline-delimited line per
//! message. Positions are byte-exact: the checkpointed offset is always the
//! first byte after the last line handed to the producer. A path is streamed
//! by one worker at a time; requests for it meanwhile are run by that worker
//! once its current pass ends.
//!
//! Per line:
//! - accepted by the producer: continue
//! - empty: skipped
//! - fatal error: logged and dropped
//! - retryable error: wait (drain on backpressure, poll otherwise) and try
//!   again; after the third retryable failure the line goes to the archive

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::exporters::kafka::archive::{FailedMessageArchive, archive_or_log};
use crate::exporters::kafka::claims::FileClaims;
use crate::exporters::kafka::errors::PublishError;
use crate::receivers::dir::{CheckpointStore, ItemOrigin, ReadFrom, WorkItem};
use crate::topic_config::RuntimeKnobs;
use crate::topics::{TopicEntry, TopicRegistry};
use crate::work_queue::WorkQueue;

/// Publish attempts per line before it is archived.
pub const MAX_ATTEMPTS: u32 = 3;

/// Outcome of one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    Sent,
    Skipped,
    Dropped,
    Archived,
}

/// Outcome of one work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileReport {
    pub sent: u64,
    pub skipped: u64,
    pub dropped: u64,
    pub archived: u64,
    /// Byte offset reached
    pub position: u64,
    /// The whole file was read
    pub complete: bool,
}

impl FileReport {
    /// Fold a later pass over the same file into this report.
    fn absorb(&mut self, later: FileReport) {
        self.sent += later.sent;
        self.skipped += later.skipped;
        self.dropped += later.dropped;
        self.archived += later.archived;
        self.position = later.position;
        self.complete = later.complete;
    }

    fn record(&mut self, outcome: LineOutcome) {
        match outcome {
            LineOutcome::Sent => self.sent += 1,
            LineOutcome::Skipped => self.skipped += 1,
            LineOutcome::Dropped => self.dropped += 1,
            LineOutcome::Archived => self.archived += 1,
        }
    }

    fn lines(&self) -> u64 {
        self.sent + self.skipped + self.dropped + self.archived
    }
}

/// Totals across every worker of a pool.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    pub files: AtomicU64,
    pub sent: AtomicU64,
    pub dropped: AtomicU64,
    pub archived: AtomicU64,
}

impl DeliveryStats {
    fn add(&self, report: &FileReport) {
        self.files.fetch_add(1, Ordering::Relaxed);
        self.sent.fetch_add(report.sent, Ordering::Relaxed);
        self.dropped.fetch_add(report.dropped, Ordering::Relaxed);
        self.archived.fetch_add(report.archived, Ordering::Relaxed);
    }
}

/// Everything a worker needs, shared by all workers of a pool.
#[derive(Clone)]
pub struct DeliveryContext {
    pub queue: WorkQueue,
    pub topics: Arc<TopicRegistry>,
    pub checkpoints: Arc<CheckpointStore>,
    pub archive: Arc<FailedMessageArchive>,
    pub claims: Arc<FileClaims>,
}

impl DeliveryContext {
    pub fn new(
        queue: WorkQueue,
        topics: Arc<TopicRegistry>,
        checkpoints: Arc<CheckpointStore>,
        archive: Arc<FailedMessageArchive>,
    ) -> Self {
        Self {
            queue,
            topics,
            checkpoints,
            archive,
            claims: Arc::new(FileClaims::new()),
        }
    }
}

pub struct DeliveryWorker {
    ctx: DeliveryContext,
    running: Arc<AtomicBool>,
}

impl DeliveryWorker {
    pub fn new(ctx: DeliveryContext, running: Arc<AtomicBool>) -> Self {
        Self { ctx, running }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Deliver one work item. Returns None when the item was discarded
    /// without reading.
    pub fn process(&self, item: &WorkItem) -> Option<FileReport> {
        if !item.path.is_file() {
            warn!(item = %item, "File no longer exists, skipping");
            return None;
        }

        let Some(entry) = self.ctx.topics.get(&item.topic) else {
            warn!(item = %item, "No such topic, dropping work item");
            return None;
        };

        if item.start == ReadFrom::MarkOnly {
            self.ctx.claims.forget(&item.path);
            self.mark(item);
            return None;
        }

        let Some(mut claim) = self.ctx.claims.claim(&item.path, item.start) else {
            debug!(item = %item, "File is being delivered by another worker, handing over");
            return None;
        };

        let knobs = entry.config.knobs();
        let mut start = item.start;
        let mut report: Option<FileReport> = None;
        loop {
            match self.deliver(item, &entry, &knobs, start) {
                Ok(pass) => {
                    claim.finished_at(pass.position);
                    report = Some(match report.take() {
                        Some(mut total) => {
                            total.absorb(pass);
                            total
                        }
                        None => pass,
                    });
                }
                Err(e) => error!(item = %item, "Failed to read file: {}", e),
            }
            match claim.next() {
                Some(next) if self.is_running() => {
                    debug!(item = %item, start = next.as_i64(), "Delivering handed-over request");
                    start = next;
                }
                _ => break,
            }
        }
        drop(claim);
        let report = report?;

        // Hand queued messages to the broker before taking the next item.
        let outstanding = entry.producer.drain_outbound(0, knobs.poll_timeout);
        if outstanding > 0 {
            debug!(topic = %item.topic, outstanding, "Messages still in flight after file");
        }

        if item.origin == ItemOrigin::Archive && report.complete {
            match fs::remove_file(&item.path) {
                Ok(()) => debug!(path = ?item.path, "Removed replayed archive file"),
                Err(e) => warn!(path = ?item.path, "Failed to remove replayed archive file: {}", e),
            }
        }

        debug!(
            item = %item,
            sent = report.sent,
            archived = report.archived,
            dropped = report.dropped,
            position = report.position,
            "Finished file"
        );
        Some(report)
    }

    /// Resolve `start` to a byte offset and stream from there.
    fn deliver(
        &self,
        item: &WorkItem,
        entry: &TopicEntry,
        knobs: &RuntimeKnobs,
        start: ReadFrom,
    ) -> io::Result<FileReport> {
        let mut offset = match start {
            ReadFrom::Beginning => 0,
            ReadFrom::Offset(offset) => offset,
            ReadFrom::Continue | ReadFrom::MarkOnly => self.continue_offset(item),
        };

        let len = fs::metadata(&item.path)?.len();
        if offset > len {
            warn!(item = %item, offset, len, "File is shorter than its resume offset, reading from the beginning");
            offset = 0;
        }
        self.stream_file(item, entry, knobs, offset)
    }

    /// First unread byte of a file that was delivered before, if any.
    fn continue_offset(&self, item: &WorkItem) -> u64 {
        if let Some(position) = self.ctx.claims.position(&item.path) {
            return position;
        }
        match (item.directory(), item.file_name()) {
            (Some(dir), Some(name)) => self
                .ctx
                .checkpoints
                .get(dir)
                .filter(|cp| cp.file == name)
                .map_or(0, |cp| cp.offset),
            _ => 0,
        }
    }

    fn stream_file(
        &self,
        item: &WorkItem,
        entry: &TopicEntry,
        knobs: &RuntimeKnobs,
        start: u64,
    ) -> io::Result<FileReport> {
        let mut file = File::open(&item.path)?;
        if start > 0 {
            file.seek(SeekFrom::Start(start))?;
        }
        let mut reader = BufReader::new(file);

        let mut report = FileReport {
            position: start,
            ..Default::default()
        };
        let mut line = Vec::new();
        loop {
            if !self.is_running() {
                debug!(item = %item, position = report.position, "Stopping mid-file");
                break;
            }

            line.clear();
            let read = match reader.read_until(b'\n', &mut line) {
                Ok(read) => read,
                Err(e) => {
                    // Keep what was forwarded so far.
                    self.checkpoint(item, report.position);
                    return Err(e);
                }
            };
            if read == 0 {
                report.complete = true;
                break;
            }
            report.position += read as u64;

            let body = line.strip_suffix(b"\n").unwrap_or(&line);
            report.record(self.publish_line(entry, knobs, body));

            if report.lines() % knobs.checkpoint_batch == 0 {
                self.checkpoint(item, report.position);
            }
        }

        self.checkpoint(item, report.position);
        Ok(report)
    }

    /// Publish one line with up to `MAX_ATTEMPTS` attempts.
    pub fn publish_line(&self, entry: &TopicEntry, knobs: &RuntimeKnobs, line: &[u8]) -> LineOutcome {
        let producer = &entry.producer;
        let mut failures = 0;
        loop {
            let err = match producer.publish(line) {
                Ok(()) => return LineOutcome::Sent,
                Err(PublishError::EmptyLine) => return LineOutcome::Skipped,
                Err(err @ PublishError::Fatal(_)) => {
                    error!(topic = %entry.name(), bytes = line.len(), "Dropping line: {}", err);
                    return LineOutcome::Dropped;
                }
                Err(err) => err,
            };

            failures += 1;
            if failures >= MAX_ATTEMPTS {
                warn!(topic = %entry.name(), attempts = failures, "Archiving line: {}", err);
                archive_or_log(&self.ctx.archive, entry.name(), line);
                return LineOutcome::Archived;
            }

            match err {
                PublishError::Backpressure => {
                    producer.drain_outbound(knobs.backpressure_threshold, knobs.poll_timeout);
                }
                _ => producer.poll(knobs.poll_timeout),
            }
        }
    }

    fn checkpoint(&self, item: &WorkItem, offset: u64) {
        if item.origin == ItemOrigin::Archive {
            return;
        }
        let (Some(dir), Some(name)) = (item.directory(), item.file_name()) else {
            warn!(item = %item, "Cannot checkpoint path");
            return;
        };
        if let Err(e) = self.ctx.checkpoints.update(dir, name, offset) {
            warn!(item = %item, "Failed to update checkpoint: {}", e);
        }
    }

    fn mark(&self, item: &WorkItem) {
        let (Some(dir), Some(name)) = (item.directory(), item.file_name()) else {
            warn!(item = %item, "Cannot checkpoint path");
            return;
        };
        if let Err(e) = self.ctx.checkpoints.mark(dir, name) {
            warn!(item = %item, "Failed to mark file: {}", e);
        }
    }

    fn run(self, idle_wait: Duration, stats: Arc<DeliveryStats>) {
        while self.is_running() {
            let Some(item) = self.ctx.queue.pop_timeout(idle_wait) else {
                continue;
            };
            if let Some(report) = self.process(&item) {
                stats.add(&report);
            }
        }
    }
}

/// A fixed set of worker threads sharing one queue.
pub struct DeliveryPool {
    ctx: DeliveryContext,
    idle_wait: Duration,
    running: Arc<AtomicBool>,
    stats: Arc<DeliveryStats>,
    workers: Vec<JoinHandle<()>>,
}

impl DeliveryPool {
    pub fn new(ctx: DeliveryContext) -> Self {
        Self {
            ctx,
            idle_wait: Duration::from_millis(500),
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(DeliveryStats::default()),
            workers: Vec::new(),
        }
    }

    /// How long an idle worker waits for an item before checking for stop.
    pub fn with_idle_wait(mut self, idle_wait: Duration) -> Self {
        self.idle_wait = idle_wait;
        self
    }

    pub fn stats(&self) -> &DeliveryStats {
        &self.stats
    }

    pub fn start(&mut self, count: usize) -> io::Result<()> {
        if !self.workers.is_empty() {
            return Ok(());
        }

        self.running.store(true, Ordering::SeqCst);
        for i in 0..count.max(1) {
            let worker = DeliveryWorker::new(self.ctx.clone(), self.running.clone());
            let idle_wait = self.idle_wait;
            let stats = self.stats.clone();
            let handle = thread::Builder::new()
                .name(format!("delivery-{}", i))
                .spawn(move || worker.run(idle_wait, stats))?;
            self.workers.push(handle);
        }

        info!(workers = self.workers.len(), "Delivery workers started");
        Ok(())
    }

    /// Stop after the current line of every worker and join them.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let count = self.workers.len();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("Delivery worker panicked");
            }
        }
        if count > 0 {
            info!(
                files = self.stats.files.load(Ordering::Relaxed),
                sent = self.stats.sent.load(Ordering::Relaxed),
                archived = self.stats.archived.load(Ordering::Relaxed),
                dropped = self.stats.dropped.load(Ordering::Relaxed),
                "Delivery workers stopped"
            );
        }
    }
}

impl Drop for DeliveryPool {
    fn drop(&mut self) {
        self.stop();
    }
}
