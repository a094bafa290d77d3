//! Error event published when a message cannot be processed

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::InboundMessage;

/// Structured failure report, serialized as the payload of an "error" event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    /// Name of the consumer (group id) that failed
    pub consumer: String,

    /// Handler that failed, when the failure is attributable to one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler_name: Option<String>,

    /// Error description
    pub message: String,

    /// Error chain / backtrace
    pub stack: String,

    /// Raw payload of the message that caused the error
    pub encoded_dto: String,

    /// Source topic
    pub topic: String,

    /// Source partition
    pub partition: i32,

    /// Source offset
    pub offset: i64,

    /// When the error occurred
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(
        consumer: impl Into<String>,
        handler_name: Option<String>,
        message: impl Into<String>,
        stack: impl Into<String>,
        causative: &InboundMessage,
    ) -> Self {
        Self {
            consumer: consumer.into(),
            handler_name,
            message: message.into(),
            stack: stack.into(),
            encoded_dto: causative.payload_str().into_owned(),
            topic: causative.topic.clone(),
            partition: causative.partition,
            offset: causative.offset,
            timestamp: Utc::now(),
        }
    }

    /// Key used when publishing, derived from the source position
    pub fn key(&self) -> String {
        format!("{}-{}-{}", self.topic, self.partition, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_record_serialization() {
        let raw = InboundMessage::new("events", 0, 100, "not json");
        let record = ErrorRecord::new("billing", None, "Decode error", "trace", &raw);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["consumer"], "billing");
        assert_eq!(json["encodedDto"], "not json");
        assert_eq!(json["offset"], 100);
        assert!(json.get("handlerName").is_none());
        assert_eq!(record.key(), "events-0-100");
    }

    #[test]
    fn test_handler_name_is_kept() {
        let raw = InboundMessage::new("events", 1, 5, "{}");
        let record = ErrorRecord::new(
            "billing",
            Some("invoice-writer".to_string()),
            "boom",
            "",
            &raw,
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["handlerName"], "invoice-writer");
    }
}
