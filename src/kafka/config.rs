//! Kafka configuration module

use envconfig::Envconfig;
use std::time::Duration;

/// Kafka configuration settings
#[derive(Debug, Clone, Envconfig)]
pub struct KafkaConfig {
    /// Kafka broker addresses (comma-separated)
    #[envconfig(from = "KAFKA_HOST", default = "localhost:9092")]
    pub brokers: String,

    /// SASL username (API key)
    #[envconfig(from = "KAFKA_USERNAME")]
    pub username: Option<String>,

    /// SASL password (API secret)
    #[envconfig(from = "KAFKA_PASSWORD")]
    pub password: Option<String>,

    /// Consumer group ID, replaced by the consumer name when a consumer is built
    #[envconfig(from = "KAFKA_GROUP_ID", default = "consumer-wrapper")]
    pub group_id: String,

    /// Topics to consume events from (comma-separated)
    #[envconfig(from = "EVENT_TOPIC", default = "events")]
    pub event_topic: String,

    /// Topic receiving error events
    #[envconfig(from = "ERROR_TOPIC", default = "errors")]
    pub error_topic: String,

    /// Maximum number of messages fetched per poll
    #[envconfig(from = "KAFKA_MESSAGES_PER_CONSUMPTION", default = "1")]
    pub messages_per_consumption: usize,

    /// Let the broker client commit offsets on its own
    #[envconfig(from = "KAFKA_AUTO_COMMIT", default = "false")]
    pub auto_commit: bool,

    /// Process the messages of one batch concurrently
    #[envconfig(from = "KAFKA_PARALLEL_CONSUMPTION", default = "false")]
    pub parallel_consumption: bool,

    /// How long one poll waits for the first message in milliseconds
    #[envconfig(from = "KAFKA_POLL_TIMEOUT_MS", default = "1000")]
    pub poll_timeout_ms: u64,

    /// Session timeout in milliseconds
    #[envconfig(from = "KAFKA_SESSION_TIMEOUT_MS", default = "30000")]
    pub session_timeout_ms: u32,

    /// Auto offset reset (earliest, latest)
    #[envconfig(from = "KAFKA_AUTO_OFFSET_RESET", default = "earliest")]
    pub auto_offset_reset: String,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            username: None,
            password: None,
            group_id: "consumer-wrapper".to_string(),
            event_topic: "events".to_string(),
            error_topic: "errors".to_string(),
            messages_per_consumption: 1,
            auto_commit: false,
            parallel_consumption: false,
            poll_timeout_ms: 1000,
            session_timeout_ms: 30000,
            auto_offset_reset: "earliest".to_string(),
        }
    }
}

impl KafkaConfig {
    /// Create a new KafkaConfig from environment variables
    pub fn from_env() -> Result<Self, envconfig::Error> {
        <Self as envconfig::Envconfig>::init_from_env()
    }

    /// Get the poll timeout as Duration
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Subscribed topics as a vector
    pub fn topics(&self) -> Vec<String> {
        self.event_topic
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// SASL credentials, only when both halves are present
    pub fn sasl_credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => Some((user, pass)),
            _ => None,
        }
    }

    /// Build rdkafka consumer configuration
    pub fn build_consumer_config(&self) -> rdkafka::ClientConfig {
        let mut config = self.base_config();

        config
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", self.auto_commit.to_string())
            .set("session.timeout.ms", self.session_timeout_ms.to_string())
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("enable.partition.eof", "false");

        config
    }

    /// Build rdkafka producer configuration for the error topic
    pub fn build_producer_config(&self) -> rdkafka::ClientConfig {
        let mut config = self.base_config();

        config
            .set("message.timeout.ms", "30000")
            .set("acks", "all");

        config
    }

    fn base_config(&self) -> rdkafka::ClientConfig {
        let mut config = rdkafka::ClientConfig::new();
        config.set("bootstrap.servers", &self.brokers);

        if let Some((username, password)) = self.sasl_credentials() {
            config
                .set("security.protocol", "SASL_SSL")
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        config
    }
}
