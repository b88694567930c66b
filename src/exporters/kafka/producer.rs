// SPDX-License-Identifier: Apache-2.0

//! Broker client seam.
//!
//! Delivery workers talk to the broker only through `TopicProducer`. The
//! production implementation wraps an rdkafka `BaseProducer`; messages are
//! queued locally by `publish` and delivered by librdkafka's background
//! threads, with delivery reports served by `poll`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rdkafka::ClientContext;
use rdkafka::producer::{BaseProducer, BaseRecord, DeliveryResult, Producer, ProducerContext};
use tracing::{debug, info, warn};

use crate::exporters::kafka::config::ProducerSettings;
use crate::exporters::kafka::errors::{KafkaExportError, PublishError, Result};

/// Longest single poll while draining, so the deadline is honored closely.
const DRAIN_SLICE: Duration = Duration::from_millis(10);

/// A producer bound to one topic.
pub trait TopicProducer: Send + Sync {
    fn topic(&self) -> &str;

    /// Queue one message. An `Ok` means the message was accepted locally, not
    /// that the broker has it.
    fn publish(&self, payload: &[u8]) -> std::result::Result<(), PublishError>;

    /// Serve delivery reports for up to `timeout`.
    fn poll(&self, timeout: Duration);

    /// Poll until at most `max_remaining` messages are outstanding or
    /// `timeout` passes. Returns the number still outstanding.
    fn drain_outbound(&self, max_remaining: usize, timeout: Duration) -> usize;
}

/// Creates the producer of a topic.
pub trait ProducerFactory: Send + Sync {
    fn create(&self, topic: &str, settings: &ProducerSettings) -> Result<Arc<dyn TopicProducer>>;
}

/// Logs failed delivery reports.
pub struct DeliveryLogger {
    topic: String,
    failures: AtomicU64,
}

impl ClientContext for DeliveryLogger {}

impl ProducerContext for DeliveryLogger {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult<'_>, _: Self::DeliveryOpaque) {
        if let Err((e, _)) = result {
            let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(topic = %self.topic, failures, "Message delivery failed: {}", e);
        }
    }
}

pub struct KafkaTopicProducer {
    topic: String,
    producer: BaseProducer<DeliveryLogger>,
}

impl KafkaTopicProducer {
    pub fn new(topic: &str, settings: &ProducerSettings) -> Result<Self> {
        if topic.is_empty() {
            return Err(KafkaExportError::InvalidTopic(topic.to_string()));
        }

        let context = DeliveryLogger {
            topic: topic.to_string(),
            failures: AtomicU64::new(0),
        };
        let producer: BaseProducer<DeliveryLogger> = settings
            .build_client_config()
            .create_with_context(context)
            .map_err(|e| {
                KafkaExportError::ConfigurationError(format!("Failed to create producer: {}", e))
            })?;

        info!(topic, brokers = %settings.brokers, "Kafka producer created");
        Ok(Self {
            topic: topic.to_string(),
            producer,
        })
    }

    /// Delivery reports that carried an error so far.
    pub fn delivery_failures(&self) -> u64 {
        self.producer.context().failures.load(Ordering::Relaxed)
    }
}

impl TopicProducer for KafkaTopicProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn publish(&self, payload: &[u8]) -> std::result::Result<(), PublishError> {
        if payload.is_empty() {
            return Err(PublishError::EmptyLine);
        }

        let record = BaseRecord::<(), [u8]>::to(&self.topic).payload(payload);
        self.producer
            .send(record)
            .map_err(|(e, _)| PublishError::from(e))
    }

    fn poll(&self, timeout: Duration) {
        self.producer.poll(timeout);
    }

    fn drain_outbound(&self, max_remaining: usize, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            let outstanding = self.producer.in_flight_count().max(0) as usize;
            if outstanding <= max_remaining {
                return outstanding;
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(topic = %self.topic, outstanding, "Drain timed out");
                return outstanding;
            }
            self.producer.poll((deadline - now).min(DRAIN_SLICE));
        }
    }
}

impl Drop for KafkaTopicProducer {
    fn drop(&mut self) {
        if let Err(e) = self.producer.flush(Duration::from_secs(5)) {
            warn!(
                topic = %self.topic,
                outstanding = self.producer.in_flight_count(),
                "Failed to flush producer on shutdown: {}", e
            );
        }
    }
}

/// Creates `KafkaTopicProducer`s.
#[derive(Debug, Default, Clone, Copy)]
pub struct KafkaProducerFactory;

impl ProducerFactory for KafkaProducerFactory {
    fn create(&self, topic: &str, settings: &ProducerSettings) -> Result<Arc<dyn TopicProducer>> {
        Ok(Arc::new(KafkaTopicProducer::new(topic, settings)?))
    }
}
