//! Producer for the dedicated error topic

use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};

/// Destination for encoded error events
#[async_trait]
pub trait ErrorSink: Send + Sync {
    /// Publish one encoded event keyed by `key`
    async fn send(&self, key: &str, payload: &str) -> Result<()>;
}

/// Kafka producer writing error events to one topic
#[derive(Clone)]
pub struct ErrorProducer {
    /// Kafka producer instance
    producer: FutureProducer,

    /// Error topic name
    topic: String,

    /// Timeout for send operations
    send_timeout: Duration,
}

impl ErrorProducer {
    /// Create a new error producer
    pub fn new(config: ClientConfig, topic: String) -> Result<Self> {
        let producer: FutureProducer = config
            .create()
            .map_err(|e| Error::kafka(format!("Failed to create error producer: {}", e)))?;

        Ok(Self {
            producer,
            topic,
            send_timeout: Duration::from_secs(30),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Flush any pending messages
    pub fn flush(&self) -> Result<()> {
        self.producer
            .flush(self.send_timeout)
            .map_err(|e| Error::kafka(format!("Failed to flush error producer: {}", e)))
    }
}

#[async_trait]
impl ErrorSink for ErrorProducer {
    async fn send(&self, key: &str, payload: &str) -> Result<()> {
        let record = FutureRecord::to(&self.topic).payload(payload).key(key);

        match self.producer.send(record, self.send_timeout).await {
            Ok((partition, offset)) => {
                debug!(
                    topic = %self.topic,
                    partition,
                    offset,
                    "Sent error event"
                );
                Ok(())
            },
            Err((kafka_error, _)) => Err(Error::kafka(format!(
                "Failed to send to '{}': {}",
                self.topic, kafka_error
            ))),
        }
    }
}
