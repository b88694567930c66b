// SPDX-License-Identifier: Apache-2.0

//! End-to-end pipeline tests on the real filesystem notifier, with a
//! recording producer in place of the broker.

#![cfg(target_os = "linux")]

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tailgate::exporters::kafka::{
    ArchiveConfig, DeliveryContext, DeliveryPool, FailedMessageArchive, PublishError,
    TopicProducer,
};
use tailgate::receivers::dir::{
    CheckpointStore, DirReceiverConfig, DirectoryWatcher, NativeNotifier,
};
use tailgate::topic_config::{RemedyWindow, RuntimeKnobs, TopicConfig};
use tailgate::topics::{TopicEntry, TopicRegistry};
use tailgate::work_queue::WorkQueue;
use tempfile::TempDir;

const TOPIC: &str = "access";

#[derive(Default)]
struct RecordingProducer {
    lines: Mutex<Vec<String>>,
    /// Number of upcoming publishes that fail with a transient error
    failures: Mutex<usize>,
}

impl RecordingProducer {
    fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl TopicProducer for RecordingProducer {
    fn topic(&self) -> &str {
        TOPIC
    }

    fn publish(&self, payload: &[u8]) -> Result<(), PublishError> {
        if payload.is_empty() {
            return Err(PublishError::EmptyLine);
        }
        let mut failures = self.failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(PublishError::Transient("broker unavailable".into()));
        }
        self.lines
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(payload).into_owned());
        Ok(())
    }

    fn poll(&self, _: Duration) {}

    fn drain_outbound(&self, _: usize, _: Duration) -> usize {
        0
    }
}

struct Pipeline {
    temp_dir: TempDir,
    spool: PathBuf,
    producer: Arc<RecordingProducer>,
    checkpoints: Arc<CheckpointStore>,
    archive: Arc<FailedMessageArchive>,
    watcher: Arc<DirectoryWatcher>,
    pool: DeliveryPool,
}

impl Pipeline {
    fn start(window: RemedyWindow) -> Self {
        Self::start_in(TempDir::new().unwrap(), window)
    }

    /// Start on an existing state directory, restoring its checkpoints.
    fn start_in(temp_dir: TempDir, window: RemedyWindow) -> Self {
        let spool = temp_dir.path().join("spool");
        fs::create_dir_all(&spool).unwrap();

        let queue = WorkQueue::new();
        let checkpoints = Arc::new(CheckpointStore::new(temp_dir.path().join("checkpoints")));
        checkpoints.remedy().unwrap();

        let knobs = RuntimeKnobs {
            checkpoint_batch: 2,
            poll_timeout: Duration::from_millis(1),
            remedy_window: window,
            ..Default::default()
        };
        let config = Arc::new(TopicConfig::with_knobs(TOPIC, vec![spool.clone()], knobs).unwrap());
        let producer = Arc::new(RecordingProducer::default());
        let topics = Arc::new(TopicRegistry::new());
        topics.insert(TopicEntry::new(config.clone(), producer.clone()));

        let archive = Arc::new(FailedMessageArchive::new(
            ArchiveConfig {
                dir: temp_dir.path().join("archive"),
                flush_interval: Duration::from_secs(3600),
                archive_only: false,
            },
            queue.clone(),
        ));

        let mut pool = DeliveryPool::new(DeliveryContext::new(
            queue.clone(),
            topics,
            checkpoints.clone(),
            archive.clone(),
        ))
        .with_idle_wait(Duration::from_millis(20));
        pool.start(2).unwrap();

        let receiver = DirReceiverConfig {
            checkpoint_path: temp_dir.path().join("checkpoints"),
            settle_age: Duration::ZERO,
            settle_poll: Duration::from_millis(10),
            event_wait: Duration::from_millis(100),
            ..Default::default()
        };
        let watcher = Arc::new(DirectoryWatcher::new(
            Arc::new(NativeNotifier::new().unwrap()),
            checkpoints.clone(),
            queue,
            receiver,
        ));
        watcher.add_watch_topic(&config).unwrap();
        watcher.start().unwrap();

        Pipeline {
            temp_dir,
            spool,
            producer,
            checkpoints,
            archive,
            watcher,
            pool,
        }
    }

    fn stop(mut self) -> TempDir {
        self.watcher.stop().unwrap();
        self.pool.stop();
        self.checkpoints.save().unwrap();
        self.temp_dir
    }
}

fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    cond()
}

#[test]
fn written_file_is_forwarded_and_checkpointed() {
    let p = Pipeline::start(RemedyWindow::BeforeRegistration);

    fs::write(p.spool.join("a.log"), "GET /\nGET /health\nPOST /login\n").unwrap();

    assert!(wait_for(|| p.producer.lines().len() == 3));
    assert_eq!(
        p.producer.lines(),
        vec!["GET /", "GET /health", "POST /login"]
    );
    assert!(wait_for(|| p
        .checkpoints
        .get(&p.spool)
        .is_some_and(|cp| cp.file == "a.log" && cp.offset == 30)));

    let spool = p.spool.clone();
    let temp_dir = p.stop();
    let saved = fs::read_to_string(temp_dir.path().join("checkpoints")).unwrap();
    assert_eq!(saved, format!("{}:30\n", spool.join("a.log").display()));
}

#[test]
fn moved_in_file_is_forwarded() {
    let p = Pipeline::start(RemedyWindow::BeforeRegistration);

    let staging = p.temp_dir.path().join("a.log.tmp");
    fs::write(&staging, "first\nsecond\n").unwrap();
    fs::rename(&staging, p.spool.join("a.log")).unwrap();

    assert!(wait_for(|| p.producer.lines() == vec!["first", "second"]));
    p.stop();
}

#[test]
fn new_subdirectory_is_watched() {
    let p = Pipeline::start(RemedyWindow::BeforeRegistration);

    let sub = p.spool.join("2024-06-01");
    fs::create_dir(&sub).unwrap();
    assert!(wait_for(|| p.watcher.watched_dirs(TOPIC).contains(&sub)));

    fs::write(sub.join("b.log"), "nested\n").unwrap();
    assert!(wait_for(|| p.producer.lines() == vec!["nested"]));
    p.stop();
}

#[test]
fn restart_resumes_at_checkpoint() {
    let first = Pipeline::start(RemedyWindow::BeforeRegistration);
    let mut file = fs::File::create(first.spool.join("a.log")).unwrap();
    file.write_all(b"one\ntwo\n").unwrap();
    drop(file);
    assert!(wait_for(|| first.producer.lines().len() == 2));
    assert!(wait_for(|| first
        .checkpoints
        .get(&first.spool)
        .is_some_and(|cp| cp.file == "a.log" && cp.offset == 8)));

    let spool = first.spool.clone();
    let temp_dir = first.stop();

    // Appended while nothing is running; no event will report it
    fs::OpenOptions::new()
        .append(true)
        .open(spool.join("a.log"))
        .unwrap()
        .write_all(b"three\n")
        .unwrap();

    let second = Pipeline::start_in(temp_dir, RemedyWindow::BeforeRegistration);
    assert!(wait_for(|| second.producer.lines() == vec!["three"]));
    assert!(wait_for(|| second
        .checkpoints
        .get(&second.spool)
        .is_some_and(|cp| cp.offset == 14)));
    second.stop();
}

#[test]
fn files_written_before_start_are_replayed() {
    let temp_dir = TempDir::new().unwrap();
    let spool = temp_dir.path().join("spool");
    fs::create_dir(&spool).unwrap();
    fs::write(spool.join("old.log"), "stale\n").unwrap();
    std::thread::sleep(Duration::from_millis(20));

    let p = Pipeline::start_in(temp_dir, RemedyWindow::BeforeRegistration);
    assert!(wait_for(|| p.producer.lines() == vec!["stale"]));
    p.stop();
}

#[test]
fn never_window_skips_files_written_before_start() {
    let temp_dir = TempDir::new().unwrap();
    let spool = temp_dir.path().join("spool");
    fs::create_dir(&spool).unwrap();
    fs::write(spool.join("old.log"), "stale\n").unwrap();

    let p = Pipeline::start_in(temp_dir, RemedyWindow::Never);
    fs::write(p.spool.join("new.log"), "fresh\n").unwrap();

    assert!(wait_for(|| p.producer.lines() == vec!["fresh"]));
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(p.producer.lines(), vec!["fresh"]);
    p.stop();
}

#[test]
fn subdirectory_populated_before_its_watch_is_replayed() {
    let p = Pipeline::start(RemedyWindow::BeforeRegistration);

    // Populated elsewhere and moved in whole, so only the directory event fires.
    let staging = p.temp_dir.path().join("staging");
    fs::create_dir(&staging).unwrap();
    fs::write(staging.join("early.log"), "early\n").unwrap();
    let sub = p.spool.join("2024-06-02");
    fs::rename(&staging, &sub).unwrap();

    assert!(wait_for(|| p.producer.lines() == vec!["early"]));
    p.stop();
}

#[test]
fn file_appended_in_sessions_is_sent_once() {
    let p = Pipeline::start(RemedyWindow::BeforeRegistration);
    let path = p.spool.join("app.log");

    for session in 0..3 {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .unwrap();
        writeln!(file, "session-{}", session).unwrap();
        drop(file);
        assert!(wait_for(|| p.producer.lines().len() == session + 1));
    }

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(
        p.producer.lines(),
        vec!["session-0", "session-1", "session-2"]
    );
    assert!(wait_for(|| p
        .checkpoints
        .get(&p.spool)
        .is_some_and(|cp| cp.file == "app.log" && cp.offset == 30)));
    p.stop();
}

#[test]
fn files_inside_window_are_replayed() {
    let temp_dir = TempDir::new().unwrap();
    let spool = temp_dir.path().join("spool");
    fs::create_dir(&spool).unwrap();
    fs::write(spool.join("recent.log"), "missed\n").unwrap();

    let p = Pipeline::start_in(temp_dir, RemedyWindow::Within(Duration::from_secs(3600)));
    assert!(wait_for(|| p.producer.lines() == vec!["missed"]));
    p.stop();
}

#[test]
fn exhausted_lines_are_archived_and_replayed() {
    let p = Pipeline::start(RemedyWindow::BeforeRegistration);
    *p.producer.failures.lock().unwrap() = 3;

    fs::write(p.spool.join("a.log"), "lost\nkept\n").unwrap();
    assert!(wait_for(|| p.producer.lines() == vec!["kept"]));

    let closed = p.archive.close_all();
    assert_eq!(closed.len(), 1);
    assert!(wait_for(|| p.producer.lines() == vec!["kept", "lost"]));
    assert!(wait_for(|| !closed[0].exists()));
    p.stop();
}
