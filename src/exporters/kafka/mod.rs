// SPDX-License-Identifier: Apache-2.0

//! Kafka delivery.
//!
//! Forwards the lines of spooled files to Apache Kafka topics using the
//! rdkafka library.
//!
//! # Modules
//!
//! - `config`: Producer settings and their librdkafka mapping
//! - `errors`: Producer setup errors and per-line publish outcomes
//! - `producer`: The `TopicProducer` seam and its rdkafka implementation
//! - `delivery`: Worker threads streaming files to producers
//! - `claims`: One worker per file, and where each file was left
//! - `archive`: Local archive for lines that could not be delivered

pub mod archive;
pub mod claims;
pub mod config;
pub mod delivery;
pub mod errors;
pub mod producer;


pub use archive::{ArchiveConfig, ArchiveFlusher, FailedMessageArchive};
pub use claims::FileClaims;
pub use config::{AcknowledgementMode, PartitionerType, ProducerSettings};
pub use delivery::{DeliveryContext, DeliveryPool, DeliveryStats, DeliveryWorker, FileReport};
pub use errors::{KafkaExportError, PublishError};
pub use producer::{KafkaProducerFactory, KafkaTopicProducer, ProducerFactory, TopicProducer};
