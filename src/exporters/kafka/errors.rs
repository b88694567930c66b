// SPDX-License-Identifier: Apache-2.0

use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

/// Errors that can occur while setting up a Kafka producer
#[derive(Error, Debug)]
pub enum KafkaExportError {
    /// Error from Kafka producer
    #[error("Kafka producer error: {0}")]
    ProducerError(#[from] KafkaError),

    /// Configuration error
    #[error("Invalid configuration: {0}")]
    ConfigurationError(String),

    /// Topic name rejected before reaching the broker
    #[error("Invalid topic name: {0:?}")]
    InvalidTopic(String),
}

/// Outcome of a single failed publish attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The producer's local outbound queue is full
    #[error("outbound queue full")]
    Backpressure,

    /// Temporary broker or network condition
    #[error("transient producer error: {0}")]
    Transient(String),

    /// Nothing to send
    #[error("empty line")]
    EmptyLine,

    /// The message can never be delivered as is
    #[error("fatal producer error: {0}")]
    Fatal(String),
}

impl PublishError {
    /// Whether another attempt at the same line can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishError::Backpressure | PublishError::Transient(_))
    }
}

impl From<KafkaError> for PublishError {
    fn from(error: KafkaError) -> Self {
        match error.rdkafka_error_code() {
            Some(RDKafkaErrorCode::QueueFull) => PublishError::Backpressure,
            Some(
                RDKafkaErrorCode::MessageSizeTooLarge
                | RDKafkaErrorCode::UnknownTopic
                | RDKafkaErrorCode::UnknownTopicOrPartition
                | RDKafkaErrorCode::InvalidMessage
                | RDKafkaErrorCode::TopicAuthorizationFailed
                | RDKafkaErrorCode::Fatal,
            ) => PublishError::Fatal(error.to_string()),
            _ => PublishError::Transient(error.to_string()),
        }
    }
}

/// Result type for Kafka producer setup
pub type Result<T> = std::result::Result<T, KafkaExportError>;
