//! Raw broker message as seen by the consumption loop

use rdkafka::message::{BorrowedMessage, Message};
use std::borrow::Cow;

/// A message fetched from the broker, owned for one processing cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Raw payload bytes
    pub payload: Vec<u8>,

    /// Source topic
    pub topic: String,

    /// Source partition
    pub partition: i32,

    /// Offset within the partition
    pub offset: i64,

    /// Message key (if any)
    pub key: Option<Vec<u8>>,

    /// Broker timestamp in milliseconds since epoch
    pub timestamp: Option<i64>,
}

impl InboundMessage {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            payload: payload.into(),
            topic: topic.into(),
            partition,
            offset,
            key: None,
            timestamp: None,
        }
    }

    /// Payload as text, lossily decoded
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Offset to commit once this message is done
    pub fn next_offset(&self) -> i64 {
        self.offset + 1
    }
}

impl<'a> From<&BorrowedMessage<'a>> for InboundMessage {
    fn from(message: &BorrowedMessage<'a>) -> Self {
        Self {
            payload: message.payload().map(|p| p.to_vec()).unwrap_or_default(),
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(|k| k.to_vec()),
            timestamp: message.timestamp().to_millis(),
        }
    }
}
