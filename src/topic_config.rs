// SPDX-License-Identifier: Apache-2.0

//! Per-topic configuration.
//!
//! A topic's name and directory set are fixed when the topic is added. The
//! delivery knobs and the remedy window can be changed while the topic is
//! running; they are kept as one snapshot behind a single lock so an update
//! either applies completely or not at all.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;

/// Policy for replaying plain files that already exist when a directory watch
/// is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemedyWindow {
    /// Never replay pre-existing plain files. Wire value `-1`.
    Never,
    /// Replay every plain file changed before the watch was registered, with
    /// no age limit. Wire value `0`.
    BeforeRegistration,
    /// Replay files changed within the given window before now. Wire value `N > 0`
    /// seconds.
    Within(Duration),
}

impl RemedyWindow {
    /// Signed wire representation used in configuration files.
    pub fn as_secs(&self) -> i64 {
        match self {
            RemedyWindow::Never => -1,
            RemedyWindow::BeforeRegistration => 0,
            RemedyWindow::Within(d) => d.as_secs() as i64,
        }
    }

    /// Oldest change time a plain file may have to be replayed, or None when
    /// plain files are never replayed.
    pub fn cutoff(&self, now: SystemTime) -> Option<SystemTime> {
        match self {
            RemedyWindow::Never => None,
            RemedyWindow::BeforeRegistration => Some(UNIX_EPOCH),
            RemedyWindow::Within(d) => Some(now.checked_sub(*d).unwrap_or(UNIX_EPOCH)),
        }
    }
}

impl TryFrom<i64> for RemedyWindow {
    type Error = ConfigError;

    fn try_from(secs: i64) -> Result<Self, Self::Error> {
        match secs {
            -1 => Ok(RemedyWindow::Never),
            0 => Ok(RemedyWindow::BeforeRegistration),
            n if n > 0 => Ok(RemedyWindow::Within(Duration::from_secs(n as u64))),
            n => Err(ConfigError::InvalidRemedyWindow(n)),
        }
    }
}

impl fmt::Display for RemedyWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemedyWindow::Never => write!(f, "never"),
            RemedyWindow::BeforeRegistration => write!(f, "before-registration"),
            RemedyWindow::Within(d) => write!(f, "within {}s", d.as_secs()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("topic name must not be empty")]
    EmptyTopic,

    #[error("topic {0} has no directories")]
    NoDirectories(String),

    #[error("{field} must be positive, got {value}")]
    NotPositive { field: &'static str, value: i64 },

    #[error("remedy window must be -1, 0 or a positive number of seconds, got {0}")]
    InvalidRemedyWindow(i64),
}

/// Validated runtime knobs of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeKnobs {
    /// Lines forwarded between two checkpoint updates.
    pub checkpoint_batch: u64,
    /// Upper bound for a single broker poll or drain wait.
    pub poll_timeout: Duration,
    /// Outbound queue depth the worker drains down to under backpressure.
    pub backpressure_threshold: usize,
    pub remedy_window: RemedyWindow,
}

impl Default for RuntimeKnobs {
    fn default() -> Self {
        Self {
            checkpoint_batch: 100,
            poll_timeout: Duration::from_millis(100),
            backpressure_threshold: 10_000,
            remedy_window: RemedyWindow::BeforeRegistration,
        }
    }
}

/// Raw, unvalidated runtime settings as they appear in a configuration file.
///
/// Unset fields fall back to the base knobs they are applied on top of.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub checkpoint_batch: Option<i64>,
    pub poll_timeout_ms: Option<i64>,
    pub backpressure_threshold: Option<i64>,
    pub remedy_window_secs: Option<i64>,
}

impl RuntimeSettings {
    /// Overlay these settings on `base`, validating every field.
    ///
    /// Returns an error without partial application when any numeric field is
    /// non-positive or the remedy window is below -1.
    pub fn resolve(&self, base: &RuntimeKnobs) -> Result<RuntimeKnobs, ConfigError> {
        let checkpoint_batch = match self.checkpoint_batch {
            Some(v) => positive("checkpoint_batch", v)?,
            None => base.checkpoint_batch,
        };
        let poll_timeout = match self.poll_timeout_ms {
            Some(v) => Duration::from_millis(positive("poll_timeout_ms", v)?),
            None => base.poll_timeout,
        };
        let backpressure_threshold = match self.backpressure_threshold {
            Some(v) => positive("backpressure_threshold", v)? as usize,
            None => base.backpressure_threshold,
        };
        let remedy_window = match self.remedy_window_secs {
            Some(v) => RemedyWindow::try_from(v)?,
            None => base.remedy_window,
        };

        Ok(RuntimeKnobs {
            checkpoint_batch,
            poll_timeout,
            backpressure_threshold,
            remedy_window,
        })
    }
}

fn positive(field: &'static str, value: i64) -> Result<u64, ConfigError> {
    if value <= 0 {
        return Err(ConfigError::NotPositive { field, value });
    }
    Ok(value as u64)
}

/// Process-wide defaults used to seed newly created topics.
///
/// Changing the defaults does not touch topics that already exist; the agent's
/// reconciliation pass re-applies knobs to running topics explicitly.
#[derive(Debug, Default)]
pub struct TopicDefaults {
    knobs: RwLock<RuntimeKnobs>,
}

impl TopicDefaults {
    pub fn new(knobs: RuntimeKnobs) -> Self {
        Self {
            knobs: RwLock::new(knobs),
        }
    }

    pub fn knobs(&self) -> RuntimeKnobs {
        *self.knobs.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Validate `settings` against the built-in defaults and store the result.
    pub fn update(&self, settings: &RuntimeSettings) -> Result<RuntimeKnobs, ConfigError> {
        let knobs = settings.resolve(&RuntimeKnobs::default())?;
        *self.knobs.write().unwrap_or_else(|e| e.into_inner()) = knobs;
        Ok(knobs)
    }
}

/// Configuration of a single topic.
#[derive(Debug)]
pub struct TopicConfig {
    topic: String,
    directories: Vec<PathBuf>,
    knobs: RwLock<RuntimeKnobs>,
}

pub type SharedTopicConfig = Arc<TopicConfig>;

impl TopicConfig {
    /// Create a topic seeded from the current process defaults.
    pub fn new(
        topic: impl Into<String>,
        directories: Vec<PathBuf>,
        defaults: &TopicDefaults,
    ) -> Result<Self, ConfigError> {
        Self::with_knobs(topic, directories, defaults.knobs())
    }

    pub fn with_knobs(
        topic: impl Into<String>,
        directories: Vec<PathBuf>,
        knobs: RuntimeKnobs,
    ) -> Result<Self, ConfigError> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(ConfigError::EmptyTopic);
        }
        if directories.is_empty() {
            return Err(ConfigError::NoDirectories(topic));
        }

        Ok(Self {
            topic,
            directories,
            knobs: RwLock::new(knobs),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn directories(&self) -> &[PathBuf] {
        &self.directories
    }

    /// Snapshot of the current runtime knobs.
    pub fn knobs(&self) -> RuntimeKnobs {
        *self.knobs.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn remedy_window(&self) -> RemedyWindow {
        self.knobs().remedy_window
    }

    /// Apply `settings` on top of the current knobs as one atomic replace.
    pub fn update(&self, settings: &RuntimeSettings) -> Result<RuntimeKnobs, ConfigError> {
        let mut guard = self.knobs.write().unwrap_or_else(|e| e.into_inner());
        let next = settings.resolve(&guard)?;
        *guard = next;
        Ok(next)
    }

    /// Replace the knobs wholesale with an already validated snapshot.
    pub fn replace(&self, knobs: RuntimeKnobs) {
        *self.knobs.write().unwrap_or_else(|e| e.into_inner()) = knobs;
    }
}
