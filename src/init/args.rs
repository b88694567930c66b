// SPDX-License-Identifier: Apache-2.0

use crate::BoxError;
use crate::exporters::kafka::ArchiveConfig;
use crate::init::agent::AgentConfig;
use crate::init::kafka_producer::KafkaProducerArgs;
use crate::receivers::dir::DirReceiverConfig;
use clap::Args;
use std::path::PathBuf;

#[derive(Debug, Args, Clone)]
pub struct AgentRun {
    /// Topics file describing every topic and the directories it tails
    #[arg(
        long,
        env = "TAILGATE_CONFIG",
        default_value = "/etc/tailgate/topics.toml"
    )]
    pub config: PathBuf,

    #[command(flatten)]
    pub kafka_producer: KafkaProducerArgs,

    /// Checkpoint file recording the last delivered position per directory
    #[arg(
        long,
        env = "TAILGATE_CHECKPOINT_FILE",
        default_value = "/var/lib/tailgate/checkpoints"
    )]
    pub checkpoint_file: PathBuf,

    /// Interval between checkpoint saves
    #[arg(long, env = "TAILGATE_CHECKPOINT_INTERVAL", default_value = "5s")]
    pub checkpoint_interval: humantime::Duration,

    /// Directory holding messages that could not be delivered
    #[arg(
        long,
        env = "TAILGATE_ARCHIVE_DIR",
        default_value = "/var/lib/tailgate/archive"
    )]
    pub archive_dir: PathBuf,

    /// Interval between archive rotations
    #[arg(long, env = "TAILGATE_ARCHIVE_INTERVAL", default_value = "60s")]
    pub archive_interval: humantime::Duration,

    /// Keep archived messages on disk instead of retrying them
    #[arg(long, env = "TAILGATE_ARCHIVE_ONLY", default_value = "false")]
    pub archive_only: bool,

    /// Number of delivery worker threads
    #[arg(long, env = "TAILGATE_WORKERS", default_value = "4")]
    pub workers: usize,

    /// Minimum time since a directory last changed before it is watched
    #[arg(long, env = "TAILGATE_SETTLE_AGE", default_value = "3s")]
    pub settle_age: humantime::Duration,

    /// Upper bound on a single wait for directory events
    #[arg(long, env = "TAILGATE_EVENT_WAIT", default_value = "120s")]
    pub event_wait: humantime::Duration,
}

impl AgentRun {
    pub fn build_config(&self) -> Result<AgentConfig, BoxError> {
        if self.workers == 0 {
            return Err("--workers must be at least 1".into());
        }

        let receiver = DirReceiverConfig {
            checkpoint_path: self.checkpoint_file.clone(),
            checkpoint_interval: self.checkpoint_interval.into(),
            settle_age: self.settle_age.into(),
            event_wait: self.event_wait.into(),
            ..Default::default()
        };
        receiver.validate()?;

        let archive = ArchiveConfig {
            dir: self.archive_dir.clone(),
            flush_interval: self.archive_interval.into(),
            archive_only: self.archive_only,
        };
        if archive.flush_interval.is_zero() {
            return Err("--archive-interval must be greater than zero".into());
        }

        Ok(AgentConfig {
            topics_file: self.config.clone(),
            producer: self.kafka_producer.build_settings(),
            receiver,
            archive,
            workers: self.workers,
        })
    }
}
