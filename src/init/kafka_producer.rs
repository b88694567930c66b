// SPDX-License-Identifier: Apache-2.0

use crate::exporters::kafka::config::{AcknowledgementMode, ProducerSettings};
use crate::init::parse;
use clap::{Args, ValueEnum};

#[derive(Debug, Args, Clone)]
pub struct KafkaProducerArgs {
    /// Kafka broker addresses (comma-separated)
    #[arg(long, env = "TAILGATE_KAFKA_BROKERS", default_value = "localhost:9092")]
    pub kafka_brokers: String,

    /// Client ID reported to the brokers
    #[arg(long, env = "TAILGATE_KAFKA_CLIENT_ID", default_value = "tailgate")]
    pub kafka_client_id: String,

    /// Compression type (gzip, snappy, lz4, zstd, none)
    #[arg(long, env = "TAILGATE_KAFKA_COMPRESSION")]
    pub kafka_compression: Option<String>,

    /// Request timeout
    #[arg(long, env = "TAILGATE_KAFKA_REQUEST_TIMEOUT", default_value = "30s")]
    pub kafka_request_timeout: humantime::Duration,

    /// Time a message may stay undelivered before it is reported as failed
    #[arg(long, env = "TAILGATE_KAFKA_MESSAGE_TIMEOUT", default_value = "5m")]
    pub kafka_message_timeout: humantime::Duration,

    /// Acknowledgement mode (none, one, all)
    #[arg(value_enum, long, env = "TAILGATE_KAFKA_ACKS", default_value = "one")]
    pub kafka_acks: KafkaAcknowledgementMode,

    /// SASL username for authentication
    #[arg(long, env = "TAILGATE_KAFKA_SASL_USERNAME")]
    pub kafka_sasl_username: Option<String>,

    /// SASL password for authentication
    #[arg(long, env = "TAILGATE_KAFKA_SASL_PASSWORD")]
    pub kafka_sasl_password: Option<String>,

    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512)
    #[arg(long, env = "TAILGATE_KAFKA_SASL_MECHANISM")]
    pub kafka_sasl_mechanism: Option<String>,

    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL)
    #[arg(
        long,
        env = "TAILGATE_KAFKA_SECURITY_PROTOCOL",
        default_value = "PLAINTEXT"
    )]
    pub kafka_security_protocol: String,

    /// Comma-separated, key=value librdkafka properties applied to every producer
    #[arg(long, env = "TAILGATE_KAFKA_PRODUCER_CONFIG", value_parser = parse::parse_key_val::<String, String>, value_delimiter = ',')]
    pub kafka_producer_config: Vec<(String, String)>,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum KafkaAcknowledgementMode {
    /// No acknowledgement required (acks=0) - fastest but least durable
    None,
    /// Wait for leader acknowledgement only (acks=1) - balanced
    One,
    /// Wait for all in-sync replicas (acks=all) - slowest but most durable
    All,
}

impl From<KafkaAcknowledgementMode> for AcknowledgementMode {
    fn from(value: KafkaAcknowledgementMode) -> Self {
        match value {
            KafkaAcknowledgementMode::None => AcknowledgementMode::None,
            KafkaAcknowledgementMode::One => AcknowledgementMode::One,
            KafkaAcknowledgementMode::All => AcknowledgementMode::All,
        }
    }
}

impl KafkaProducerArgs {
    pub fn build_settings(&self) -> ProducerSettings {
        let mut settings = ProducerSettings::new(self.kafka_brokers.clone())
            .with_client_id(self.kafka_client_id.clone())
            .with_acks(self.kafka_acks.into())
            .with_custom_config(self.kafka_producer_config.iter().cloned());

        settings.request_timeout_ms = duration_ms(self.kafka_request_timeout);
        settings.message_timeout_ms = duration_ms(self.kafka_message_timeout);

        if let Some(ref compression) = self.kafka_compression {
            settings = settings.with_compression(compression.clone());
        }

        // Configure SASL if credentials are provided
        if let (Some(username), Some(password), Some(mechanism)) = (
            &self.kafka_sasl_username,
            &self.kafka_sasl_password,
            &self.kafka_sasl_mechanism,
        ) {
            settings = settings.with_sasl_auth(
                username.clone(),
                password.clone(),
                mechanism.clone(),
                self.kafka_security_protocol.clone(),
            );
        } else {
            settings.security_protocol = Some(self.kafka_security_protocol.clone());
        }

        settings
    }
}

fn duration_ms(d: humantime::Duration) -> u32 {
    let d: std::time::Duration = d.into();
    u32::try_from(d.as_millis()).unwrap_or(u32::MAX)
}
