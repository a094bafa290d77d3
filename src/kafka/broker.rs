//! Broker session: connect, batched poll, manual commit, disconnect

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::topic_partition_list::TopicPartitionList;
use rdkafka::Offset;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::KafkaConfig;
use crate::error::{Error, Result};
use crate::models::InboundMessage;

/// Timeout used to confirm the session is ready after subscribing
const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for each further message once a batch has started
const FILL_TIMEOUT: Duration = Duration::from_millis(10);

/// The narrow broker capability the consumption loop drives
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Establish the session and subscribe to `topics`
    async fn connect(&self, topics: &[String]) -> Result<()>;

    /// Fetch up to `max_messages`; an empty batch means nothing arrived in time
    async fn poll(&self, max_messages: usize) -> Result<Vec<InboundMessage>>;

    /// Acknowledge `message` as processed
    async fn commit(&self, message: &InboundMessage) -> Result<()>;

    /// Leave the group; no-op when not connected
    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// rdkafka-backed broker session
pub struct KafkaBroker {
    config: KafkaConfig,
    consumer: RwLock<Option<Arc<StreamConsumer>>>,
    connected: AtomicBool,
}

impl KafkaBroker {
    pub fn new(config: KafkaConfig) -> Self {
        Self {
            config,
            consumer: RwLock::new(None),
            connected: AtomicBool::new(false),
        }
    }

    async fn session(&self) -> Result<Arc<StreamConsumer>> {
        self.consumer
            .read()
            .await
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| Error::Connection("consumer is not connected".to_string()))
    }
}

#[async_trait]
impl MessageBroker for KafkaBroker {
    async fn connect(&self, topics: &[String]) -> Result<()> {
        let consumer: StreamConsumer = self
            .config
            .build_consumer_config()
            .create()
            .map_err(|e| Error::Connection(format!("Failed to create Kafka consumer: {}", e)))?;

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| Error::Connection(format!("Failed to subscribe to topics: {}", e)))?;

        let consumer = Arc::new(consumer);

        // Metadata round-trip doubles as the readiness signal
        let probe = Arc::clone(&consumer);
        tokio::task::spawn_blocking(move || probe.fetch_metadata(None, READY_TIMEOUT).map(|_| ()))
            .await
            .map_err(|e| Error::internal(format!("Readiness probe panicked: {}", e)))?
            .map_err(|e| Error::Connection(format!("Kafka broker unreachable: {}", e)))?;

        *self.consumer.write().await = Some(consumer);
        self.connected.store(true, Ordering::Release);

        info!(
            brokers = %self.config.brokers,
            group_id = %self.config.group_id,
            topics = ?topics,
            "Kafka session ready"
        );
        Ok(())
    }

    async fn poll(&self, max_messages: usize) -> Result<Vec<InboundMessage>> {
        let consumer = self.session().await?;
        let mut messages = Vec::with_capacity(max_messages);

        // Wait for the first message up to the poll timeout
        match tokio::time::timeout(self.config.poll_timeout(), consumer.recv()).await {
            Ok(Ok(msg)) => messages.push(InboundMessage::from(&msg)),
            Ok(Err(e)) => return Err(Error::Poll(format!("Error receiving message: {}", e))),
            Err(_) => return Ok(messages),
        }

        // Fill the rest of the batch with whatever is already buffered
        while messages.len() < max_messages {
            match tokio::time::timeout(FILL_TIMEOUT, consumer.recv()).await {
                Ok(Ok(msg)) => messages.push(InboundMessage::from(&msg)),
                Ok(Err(e)) => return Err(Error::Poll(format!("Error receiving message: {}", e))),
                Err(_) => break,
            }
        }

        debug!(count = messages.len(), "Fetched batch");
        Ok(messages)
    }

    async fn commit(&self, message: &InboundMessage) -> Result<()> {
        let consumer = self.session().await?;

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &message.topic,
            message.partition,
            Offset::Offset(message.next_offset()),
        )
        .map_err(|e| Error::Commit(format!("Failed to track offset: {}", e)))?;

        consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| Error::Commit(format!("Failed to commit offset: {}", e)))
    }

    async fn disconnect(&self) -> Result<()> {
        let consumer = self.consumer.write().await.take();
        self.connected.store(false, Ordering::Release);

        match consumer {
            Some(consumer) => {
                consumer.unsubscribe();
                info!(group_id = %self.config.group_id, "Left consumer group");
            },
            None => debug!("Kafka session already closed"),
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}
