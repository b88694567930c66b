// SPDX-License-Identifier: Apache-2.0

//! Process wiring.
//!
//! The agent owns every long-running component and the shared state between
//! them. Start order puts consumers before producers of work: checkpoints are
//! restored, delivery workers started, then topics are registered (which runs
//! their remedy passes) and finally the event loop and timers begin. Stop
//! runs in the opposite direction so the final checkpoint save sees every
//! position the workers reached.

use crate::BoxError;
use crate::exporters::kafka::{
    ArchiveConfig, ArchiveFlusher, DeliveryContext, DeliveryPool, FailedMessageArchive,
    ProducerFactory, ProducerSettings,
};
use crate::init::config::{TopicSpec, TopicsFile};
use crate::receivers::dir::{
    CheckpointPersister, CheckpointStore, DirReceiverConfig, DirectoryNotifier, DirectoryWatcher,
};
use crate::topic_config::{TopicConfig, TopicDefaults};
use crate::topics::{TopicEntry, TopicRegistry};
use crate::work_queue::WorkQueue;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub topics_file: PathBuf,
    pub producer: ProducerSettings,
    pub receiver: DirReceiverConfig,
    pub archive: ArchiveConfig,
    pub workers: usize,
}

/// Changes applied by one `reconcile` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && self.failed.is_empty()
    }
}

pub struct Agent {
    config: AgentConfig,
    defaults: TopicDefaults,
    checkpoints: Arc<CheckpointStore>,
    topics: Arc<TopicRegistry>,
    archive: Arc<FailedMessageArchive>,
    watcher: Arc<DirectoryWatcher>,
    factory: Arc<dyn ProducerFactory>,
    persister: CheckpointPersister,
    flusher: ArchiveFlusher,
    pool: DeliveryPool,
    specs: HashMap<String, TopicSpec>,
    started: bool,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        notifier: Arc<dyn DirectoryNotifier>,
        factory: Arc<dyn ProducerFactory>,
    ) -> Self {
        let queue = WorkQueue::new();
        let checkpoints = Arc::new(CheckpointStore::new(
            config.receiver.checkpoint_path.clone(),
        ));
        let topics = Arc::new(TopicRegistry::new());
        let archive = Arc::new(FailedMessageArchive::new(
            config.archive.clone(),
            queue.clone(),
        ));
        let watcher = Arc::new(DirectoryWatcher::new(
            notifier,
            checkpoints.clone(),
            queue.clone(),
            config.receiver.clone(),
        ));
        let persister =
            CheckpointPersister::new(checkpoints.clone(), config.receiver.checkpoint_interval);
        let flusher = ArchiveFlusher::new(archive.clone());
        let pool = DeliveryPool::new(DeliveryContext::new(
            queue,
            topics.clone(),
            checkpoints.clone(),
            archive.clone(),
        ));

        Self {
            config,
            defaults: TopicDefaults::default(),
            checkpoints,
            topics,
            archive,
            watcher,
            factory,
            persister,
            flusher,
            pool,
            specs: HashMap::new(),
            started: false,
        }
    }

    pub fn topics(&self) -> &TopicRegistry {
        &self.topics
    }

    pub fn watcher(&self) -> &DirectoryWatcher {
        &self.watcher
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn start(&mut self, file: &TopicsFile) -> Result<(), BoxError> {
        if self.started {
            return Err("agent already started".into());
        }
        file.validate()?;

        let restored = self.checkpoints.remedy()?;
        info!(restored, "Checkpoints restored");

        self.defaults.update(&file.defaults)?;

        self.pool.start(self.config.workers)?;
        self.started = true;

        for spec in &file.topics {
            if let Err(e) = self.add_topic(spec) {
                error!(topic = %spec.name, "Failed to add topic: {}", e);
                self.stop();
                return Err(e);
            }
        }

        if let Err(e) = self.start_background() {
            self.stop();
            return Err(e);
        }

        info!(
            topics = self.topics.len(),
            workers = self.config.workers,
            "Agent started"
        );
        Ok(())
    }

    /// Workers resolve items by topic, so leftover archive files are only
    /// queued once every topic is registered.
    fn start_background(&mut self) -> Result<(), BoxError> {
        if let Err(e) = self.archive.replay_leftovers() {
            warn!(dir = ?self.archive.dir(), "Failed to scan archive directory: {}", e);
        }
        self.watcher.start()?;
        self.persister.start()?;
        self.flusher.start()?;
        Ok(())
    }

    /// Create the producer, publish the topic to the workers, then watch its
    /// directories. A directory that cannot be watched is logged; the topic
    /// still runs on the others.
    pub fn add_topic(&mut self, spec: &TopicSpec) -> Result<(), BoxError> {
        if self.topics.contains(&spec.name) {
            return Err(format!("topic {} already exists", spec.name).into());
        }

        let knobs = spec.knobs(&self.defaults.knobs())?;
        let config = Arc::new(TopicConfig::with_knobs(
            spec.name.clone(),
            spec.directories.clone(),
            knobs,
        )?);
        let settings = self.config.producer.for_topic(&spec.producer);
        let producer = self.factory.create(&spec.name, &settings)?;

        self.topics
            .insert(TopicEntry::new(config.clone(), producer));
        self.specs.insert(spec.name.clone(), spec.clone());

        if let Err(e) = self.watcher.add_watch_topic(&config) {
            warn!(topic = %spec.name, "Topic is missing some directories: {}", e);
        }

        info!(
            topic = %spec.name,
            directories = spec.directories.len(),
            remedy_window = %knobs.remedy_window,
            "Topic added"
        );
        Ok(())
    }

    /// Stop watching a topic and forget its producer. Items already queued
    /// for it are discarded by the workers.
    pub fn remove_topic(&mut self, name: &str) -> bool {
        let unwatched = self.watcher.remove_watch_topic(name);
        self.specs.remove(name);
        let removed = self.topics.remove(name).is_some();
        if removed {
            info!(topic = name, directories = unwatched, "Topic removed");
        }
        removed
    }

    /// Bring the running topics in line with `file`.
    ///
    /// The file is validated as a whole first; an invalid file changes
    /// nothing. Topics whose directories or producer properties changed are
    /// re-created, others get their knobs re-applied in place.
    pub fn reconcile(&mut self, file: &TopicsFile) -> Result<ReconcileReport, BoxError> {
        file.validate()?;
        self.defaults.update(&file.defaults)?;
        let defaults = self.defaults.knobs();

        let mut report = ReconcileReport::default();

        let mut stale: Vec<String> = self
            .specs
            .keys()
            .filter(|name| file.get(name).is_none())
            .cloned()
            .collect();
        stale.sort();
        for name in stale {
            self.remove_topic(&name);
            report.removed.push(name);
        }

        for spec in &file.topics {
            let current = self.specs.get(&spec.name).cloned();
            match current {
                None => match self.add_topic(spec) {
                    Ok(()) => report.added.push(spec.name.clone()),
                    Err(e) => {
                        error!(topic = %spec.name, "Failed to add topic: {}", e);
                        report.failed.push(spec.name.clone());
                    }
                },
                Some(current)
                    if current.directories != spec.directories
                        || current.producer != spec.producer =>
                {
                    self.remove_topic(&spec.name);
                    match self.add_topic(spec) {
                        Ok(()) => report.updated.push(spec.name.clone()),
                        Err(e) => {
                            error!(topic = %spec.name, "Failed to re-create topic: {}", e);
                            report.failed.push(spec.name.clone());
                        }
                    }
                }
                Some(_) => {
                    let Some(entry) = self.topics.get(&spec.name) else {
                        continue;
                    };
                    let knobs = spec.knobs(&defaults)?;
                    if entry.config.knobs() != knobs {
                        entry.config.replace(knobs);
                        info!(topic = %spec.name, "Topic settings updated");
                        report.updated.push(spec.name.clone());
                    }
                    self.specs.insert(spec.name.clone(), spec.clone());
                }
            }
        }

        info!(
            added = report.added.len(),
            updated = report.updated.len(),
            removed = report.removed.len(),
            failed = report.failed.len(),
            "Topics reconciled"
        );
        Ok(report)
    }

    /// Errors once a component has stopped on its own.
    pub fn check_health(&self) -> Result<(), BoxError> {
        if self.watcher.has_failed() {
            return Err("directory watcher stopped unexpectedly".into());
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;

        if let Err(e) = self.watcher.stop() {
            error!("Directory watcher had failed: {}", e);
        }
        self.pool.stop();
        self.flusher.stop();
        self.persister.stop();
        info!("Agent stopped");
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.stop();
    }
}
