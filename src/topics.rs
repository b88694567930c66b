// SPDX-License-Identifier: Apache-2.0

//! Registry of running topics, shared by the agent and the delivery workers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::exporters::kafka::TopicProducer;
use crate::topic_config::SharedTopicConfig;

/// A running topic: its configuration and the producer its lines go to.
#[derive(Clone)]
pub struct TopicEntry {
    pub config: SharedTopicConfig,
    pub producer: Arc<dyn TopicProducer>,
}

impl TopicEntry {
    pub fn new(config: SharedTopicConfig, producer: Arc<dyn TopicProducer>) -> Self {
        Self { config, producer }
    }

    pub fn name(&self) -> &str {
        self.config.topic()
    }
}

#[derive(Default)]
pub struct TopicRegistry {
    topics: RwLock<HashMap<String, TopicEntry>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, TopicEntry>> {
        self.topics.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, TopicEntry>> {
        self.topics.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Add or replace a topic. Returns the entry it replaced.
    pub fn insert(&self, entry: TopicEntry) -> Option<TopicEntry> {
        self.write().insert(entry.name().to_string(), entry)
    }

    pub fn get(&self, topic: &str) -> Option<TopicEntry> {
        self.read().get(topic).cloned()
    }

    pub fn remove(&self, topic: &str) -> Option<TopicEntry> {
        self.write().remove(topic)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.read().contains_key(topic)
    }

    /// Topic names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporters::kafka::PublishError;
    use crate::topic_config::{TopicConfig, TopicDefaults};
    use std::path::PathBuf;
    use std::time::Duration;

    struct NullProducer(String);

    impl TopicProducer for NullProducer {
        fn topic(&self) -> &str {
            &self.0
        }
        fn publish(&self, _: &[u8]) -> Result<(), PublishError> {
            Ok(())
        }
        fn poll(&self, _: Duration) {}
        fn drain_outbound(&self, _: usize, _: Duration) -> usize {
            0
        }
    }

    fn entry(name: &str) -> TopicEntry {
        let config =
            TopicConfig::new(name, vec![PathBuf::from("/d")], &TopicDefaults::default()).unwrap();
        TopicEntry::new(Arc::new(config), Arc::new(NullProducer(name.to_string())))
    }

    #[test]
    fn insert_get_remove() {
        let registry = TopicRegistry::new();
        assert!(registry.insert(entry("b")).is_none());
        assert!(registry.insert(entry("a")).is_none());
        assert!(registry.insert(entry("a")).is_some());

        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(registry.get("a").unwrap().producer.topic(), "a");
        assert!(registry.get("c").is_none());

        assert!(registry.remove("a").is_some());
        assert!(!registry.contains("a"));
        assert_eq!(registry.len(), 1);
    }
}
