// SPDX-License-Identifier: Apache-2.0

use rdkafka::ClientConfig;
use std::collections::HashMap;

/// Kafka acknowledgement configuration
#[derive(Clone, Debug, Default, PartialEq)]
pub enum AcknowledgementMode {
    /// No acknowledgement required (acks=0) - fastest but least durable
    None,
    /// Wait for leader acknowledgement only (acks=1)
    #[default]
    One,
    /// Wait for all in-sync replicas to acknowledge (acks=all)
    All,
}

impl AcknowledgementMode {
    /// Convert to the string value expected by librdkafka
    pub fn to_kafka_value(&self) -> &'static str {
        match self {
            AcknowledgementMode::None => "0",
            AcknowledgementMode::One => "1",
            AcknowledgementMode::All => "all",
        }
    }
}

/// Kafka partitioner type
#[derive(Clone, Debug, PartialEq)]
pub enum PartitionerType {
    /// Consistent hash partitioner
    Consistent,
    /// Random partitioner using consistent hashing
    ConsistentRandom,
    /// Murmur2 hash partitioner
    Murmur2,
    /// Random partitioner using murmur2 hashing
    Murmur2Random,
}

impl PartitionerType {
    /// Convert to the string value expected by librdkafka
    pub fn to_kafka_value(&self) -> &'static str {
        match self {
            PartitionerType::Consistent => "consistent",
            PartitionerType::ConsistentRandom => "consistent_random",
            PartitionerType::Murmur2 => "murmur2",
            PartitionerType::Murmur2Random => "murmur2_random",
        }
    }
}

/// Settings for the producer of one topic.
///
/// Process-wide settings come from the command line; each topic may add raw
/// librdkafka properties that override them.
#[derive(Clone, Debug, PartialEq)]
pub struct ProducerSettings {
    /// Kafka broker addresses (comma-separated)
    pub brokers: String,

    /// Client ID for the Kafka producer
    pub client_id: String,

    /// Acknowledgement mode for producer
    pub acks: AcknowledgementMode,

    /// Linger time in milliseconds (queue.buffering.max.ms)
    pub linger_ms: u32,

    /// Maximum number of messages in the local outbound queue
    pub queue_max_messages: u32,

    /// Message timeout in milliseconds
    pub message_timeout_ms: u32,

    /// Request timeout in milliseconds
    pub request_timeout_ms: u32,

    /// Partitioner type
    pub partitioner: Option<PartitionerType>,

    /// Enable compression
    pub compression: Option<String>,

    /// SASL username for authentication
    pub sasl_username: Option<String>,

    /// SASL password for authentication
    pub sasl_password: Option<String>,

    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512)
    pub sasl_mechanism: Option<String>,

    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL)
    pub security_protocol: Option<String>,

    /// Raw librdkafka properties, applied last
    pub producer_config: HashMap<String, String>,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            client_id: "tailgate".to_string(),
            acks: AcknowledgementMode::default(),
            linger_ms: 5,
            queue_max_messages: 100_000,
            message_timeout_ms: 300_000,
            request_timeout_ms: 30_000,
            partitioner: Some(PartitionerType::ConsistentRandom),
            compression: None,
            sasl_username: None,
            sasl_password: None,
            sasl_mechanism: None,
            security_protocol: None,
            producer_config: HashMap::new(),
        }
    }
}

impl ProducerSettings {
    pub fn new(brokers: String) -> Self {
        Self {
            brokers,
            ..Default::default()
        }
    }

    /// Set client ID
    pub fn with_client_id(mut self, client_id: String) -> Self {
        self.client_id = client_id;
        self
    }

    /// Set acknowledgement mode
    pub fn with_acks(mut self, acks: AcknowledgementMode) -> Self {
        self.acks = acks;
        self
    }

    /// Set compression type
    pub fn with_compression(mut self, compression: String) -> Self {
        self.compression = Some(compression);
        self
    }

    /// Set SASL authentication
    pub fn with_sasl_auth(
        mut self,
        username: String,
        password: String,
        mechanism: String,
        security_protocol: String,
    ) -> Self {
        self.sasl_username = Some(username);
        self.sasl_password = Some(password);
        self.sasl_mechanism = Some(mechanism);
        self.security_protocol = Some(security_protocol);
        self
    }

    /// Set custom producer configuration parameters
    pub fn with_custom_config<I>(mut self, custom_config: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.producer_config.extend(custom_config);
        self
    }

    /// Copy of these settings with a topic's raw properties layered on top.
    pub fn for_topic(&self, overrides: &HashMap<String, String>) -> Self {
        self.clone()
            .with_custom_config(overrides.iter().map(|(k, v)| (k.clone(), v.clone())))
    }

    /// Build rdkafka ClientConfig from these settings
    pub fn build_client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config.set("bootstrap.servers", &self.brokers);
        config.set("client.id", &self.client_id);
        config.set("acks", self.acks.to_kafka_value());
        config.set("linger.ms", self.linger_ms.to_string());
        config.set(
            "queue.buffering.max.messages",
            self.queue_max_messages.to_string(),
        );
        config.set("message.timeout.ms", self.message_timeout_ms.to_string());
        config.set("request.timeout.ms", self.request_timeout_ms.to_string());

        if let Some(ref partitioner) = self.partitioner {
            config.set("partitioner", partitioner.to_kafka_value());
        }

        if let Some(ref compression) = self.compression {
            config.set("compression.type", compression);
        }

        if let Some(ref protocol) = self.security_protocol {
            config.set("security.protocol", protocol);
        }

        if let Some(ref mechanism) = self.sasl_mechanism {
            config.set("sasl.mechanism", mechanism);
        }

        if let Some(ref username) = self.sasl_username {
            config.set("sasl.username", username);
        }

        if let Some(ref password) = self.sasl_password {
            config.set("sasl.password", password);
        }

        // Custom properties override built-in options if conflicts exist
        for (key, value) in &self.producer_config {
            config.set(key, value);
        }

        config
    }
}
