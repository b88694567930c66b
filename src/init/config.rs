// SPDX-License-Identifier: Apache-2.0

//! Topic file loading.
//!
//! ```toml
//! [defaults]
//! checkpoint_batch = 100
//! remedy_window_secs = 0
//!
//! [[topics]]
//! name = "web"
//! directories = ["/var/spool/web"]
//! poll_timeout_ms = 250
//!
//! [topics.producer]
//! "compression.type" = "lz4"
//! ```
//!
//! Values under `[defaults]` may be overridden from the environment with
//! `TAILGATE_TOPICS_DEFAULTS__<FIELD>`.

use crate::BoxError;
use crate::topic_config::{RuntimeKnobs, RuntimeSettings};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "TAILGATE_TOPICS_";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TopicsFile {
    pub defaults: RuntimeSettings,
    pub topics: Vec<TopicSpec>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TopicSpec {
    pub name: String,
    pub directories: Vec<PathBuf>,
    #[serde(flatten)]
    pub settings: RuntimeSettings,
    /// Raw librdkafka properties for this topic's producer
    #[serde(default)]
    pub producer: HashMap<String, String>,
}

impl TopicSpec {
    /// Knobs of this topic when created on top of `defaults`.
    pub fn knobs(&self, defaults: &RuntimeKnobs) -> Result<RuntimeKnobs, BoxError> {
        self.settings
            .resolve(defaults)
            .map_err(|e| format!("topic {}: {}", self.name, e).into())
    }
}

impl TopicsFile {
    /// Validated process defaults.
    pub fn default_knobs(&self) -> Result<RuntimeKnobs, BoxError> {
        self.defaults
            .resolve(&RuntimeKnobs::default())
            .map_err(|e| format!("defaults: {}", e).into())
    }

    /// Check the whole file without applying anything.
    pub fn validate(&self) -> Result<(), BoxError> {
        let defaults = self.default_knobs()?;

        let mut seen = HashSet::new();
        for spec in &self.topics {
            if spec.name.is_empty() {
                return Err("topic name must not be empty".into());
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(format!("topic {} is defined more than once", spec.name).into());
            }
            if spec.directories.is_empty() {
                return Err(format!("topic {} has no directories", spec.name).into());
            }
            spec.knobs(&defaults)?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TopicSpec> {
        self.topics.iter().find(|t| t.name == name)
    }
}

/// Load and validate a topic file, with environment overrides.
pub fn load_topics_file(path: &Path) -> Result<TopicsFile, BoxError> {
    if !path.is_file() {
        return Err(format!("topic file {:?} does not exist", path).into());
    }

    let figment = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"));
    extract(figment)
}

fn extract(figment: Figment) -> Result<TopicsFile, BoxError> {
    let file: TopicsFile = match figment.extract() {
        Ok(file) => file,
        Err(e) => return Err(format!("failed to parse topic file: {}", e).into()),
    };
    file.validate()?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic_config::RemedyWindow;
    use std::time::Duration;

    fn parse(toml: &str) -> Result<TopicsFile, BoxError> {
        extract(Figment::new().merge(Toml::string(toml)))
    }

    #[test]
    fn parses_topics_and_overrides() {
        let file = parse(
            r#"
            [defaults]
            checkpoint_batch = 50
            remedy_window_secs = -1

            [[topics]]
            name = "web"
            directories = ["/var/spool/web", "/var/spool/web2"]
            poll_timeout_ms = 250

            [topics.producer]
            "compression.type" = "lz4"

            [[topics]]
            name = "db"
            directories = ["/var/spool/db"]
            "#,
        )
        .unwrap();

        let defaults = file.default_knobs().unwrap();
        assert_eq!(defaults.checkpoint_batch, 50);
        assert_eq!(defaults.remedy_window, RemedyWindow::Never);

        let web = file.get("web").unwrap();
        assert_eq!(web.directories.len(), 2);
        assert_eq!(web.producer.get("compression.type").unwrap(), "lz4");
        let knobs = web.knobs(&defaults).unwrap();
        assert_eq!(knobs.poll_timeout, Duration::from_millis(250));
        assert_eq!(knobs.checkpoint_batch, 50);

        let db = file.get("db").unwrap();
        assert!(db.producer.is_empty());
        assert_eq!(db.settings, RuntimeSettings::default());
    }

    #[test]
    fn empty_file_has_no_topics() {
        let file = parse("").unwrap();
        assert!(file.topics.is_empty());
        assert_eq!(file.default_knobs().unwrap(), RuntimeKnobs::default());
    }

    #[test]
    fn rejects_invalid_files() {
        let dup = r#"
            [[topics]]
            name = "a"
            directories = ["/x"]
            [[topics]]
            name = "a"
            directories = ["/y"]
        "#;
        assert!(parse(dup).is_err());

        let no_dirs = r#"
            [[topics]]
            name = "a"
            directories = []
        "#;
        assert!(parse(no_dirs).is_err());

        let bad_knob = r#"
            [[topics]]
            name = "a"
            directories = ["/x"]
            checkpoint_batch = 0
        "#;
        assert!(parse(bad_knob).is_err());

        let bad_default = r#"
            [defaults]
            remedy_window_secs = -3
        "#;
        assert!(parse(bad_default).is_err());

        assert!(parse("topics = 5").is_err());
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("topics.toml");
        std::fs::write(
            &path,
            "[[topics]]\nname = \"web\"\ndirectories = [\"/var/spool/web\"]\n",
        )
        .unwrap();

        let file = load_topics_file(&path).unwrap();
        assert_eq!(file.topics.len(), 1);

        assert!(load_topics_file(&dir.path().join("missing.toml")).is_err());
    }
}
