//! Republishes processing failures to the error topic

use backoff::ExponentialBackoff;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use super::ErrorSink;
use crate::logging::CONSUMER_TAG;
use crate::models::{ErrorRecord, EventCodec, InboundMessage};

/// What went wrong, independent of where it came from
#[derive(Debug, Clone)]
pub struct ReportedError {
    pub message: String,
    pub stack: String,
    pub handler_name: Option<String>,
}

impl ReportedError {
    pub fn new(message: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: stack.into(),
            handler_name: None,
        }
    }

    pub fn with_handler_name(mut self, handler_name: impl Into<String>) -> Self {
        self.handler_name = Some(handler_name.into());
        self
    }
}

impl From<&crate::error::Error> for ReportedError {
    fn from(err: &crate::error::Error) -> Self {
        Self::new(err.to_string(), format!("{:?}", err))
    }
}

/// Builds error records and publishes them; never fails
pub struct ErrorReporter<C> {
    consumer: String,
    codec: Arc<C>,
    sink: Option<Arc<dyn ErrorSink>>,
    retry_budget: Duration,
}

impl<C: EventCodec> ErrorReporter<C> {
    pub fn new(consumer: impl Into<String>, codec: Arc<C>, sink: Option<Arc<dyn ErrorSink>>) -> Self {
        Self {
            consumer: consumer.into(),
            codec,
            sink,
            retry_budget: Duration::from_secs(5),
        }
    }

    /// Total time spent retrying a failed publish
    pub fn with_retry_budget(mut self, retry_budget: Duration) -> Self {
        self.retry_budget = retry_budget;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Publish `err` as an "error" event caused by `raw`
    ///
    /// Returns whether an event was published. Failures are logged and
    /// swallowed so they never replace the original error.
    pub async fn report(&self, err: &ReportedError, raw: &InboundMessage) -> bool {
        let Some(sink) = self.sink.as_ref() else {
            return false;
        };

        let record = ErrorRecord::new(
            self.consumer.clone(),
            err.handler_name.clone(),
            err.message.clone(),
            err.stack.clone(),
            raw,
        );

        let payload = match self.encode(&record) {
            Ok(payload) => payload,
            Err(encode_error) => {
                error!(
                    consumer = %self.consumer,
                    tags = CONSUMER_TAG,
                    error = %encode_error,
                    "Cannot encode error event"
                );
                return false;
            },
        };

        let key = record.key();
        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(1),
            max_elapsed_time: Some(self.retry_budget),
            ..Default::default()
        };

        let operation = || async {
            sink.send(&key, &payload).await.map_err(|e| {
                warn!(consumer = %self.consumer, error = %e, "Error event publish failed, will retry");
                backoff::Error::transient(e)
            })
        };

        match backoff::future::retry(backoff, operation).await {
            Ok(()) => true,
            Err(publish_error) => {
                error!(
                    consumer = %self.consumer,
                    tags = CONSUMER_TAG,
                    error = %publish_error,
                    original_error = %err.message,
                    "Cannot publish error event"
                );
                false
            },
        }
    }

    fn encode(&self, record: &ErrorRecord) -> crate::error::Result<String> {
        let payload: Value = serde_json::to_value(record)?;
        let event = self.codec.encode("error", payload)?;
        Ok(serde_json::to_string(&event)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JsonCodec, TaggedEvent};
    use crate::test_utils::{LogCapture, MockErrorSink};
    use tracing::Level;

    fn reporter(sink: Option<Arc<dyn ErrorSink>>) -> ErrorReporter<JsonCodec<TaggedEvent>> {
        ErrorReporter::new("billing", Arc::new(JsonCodec::new()), sink)
            .with_retry_budget(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_report_publishes_error_event() {
        let sink = Arc::new(MockErrorSink::new());
        let reporter = reporter(Some(sink.clone()));
        let raw = InboundMessage::new("events", 0, 12, "garbage");

        let published = reporter
            .report(&ReportedError::new("Decode error", "trace"), &raw)
            .await;

        assert!(published);
        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "events-0-12");

        let event: Value = serde_json::from_str(&sent[0].1).unwrap();
        assert_eq!(event["type"], "error");
        assert_eq!(event["consumer"], "billing");
        assert_eq!(event["message"], "Decode error");
        assert_eq!(event["encodedDto"], "garbage");
    }

    #[tokio::test]
    async fn test_report_carries_handler_name() {
        let sink = Arc::new(MockErrorSink::new());
        let reporter = reporter(Some(sink.clone()));
        let raw = InboundMessage::new("events", 0, 1, "{}");

        reporter
            .report(
                &ReportedError::new("boom", "").with_handler_name("ledger"),
                &raw,
            )
            .await;

        let event: Value = serde_json::from_str(&sink.sent()[0].1).unwrap();
        assert_eq!(event["handlerName"], "ledger");
    }

    #[tokio::test]
    async fn test_report_swallows_publish_failure() {
        let sink = Arc::new(MockErrorSink::failing());
        let reporter = reporter(Some(sink.clone()));
        let raw = InboundMessage::new("events", 0, 1, "{}");

        let published = reporter.report(&ReportedError::new("boom", ""), &raw).await;

        assert!(!published);
        assert!(sink.attempts() >= 1);
    }

    #[tokio::test]
    async fn test_publish_failure_logs_once_per_attempt() {
        let logs = LogCapture::new();
        let _guard = logs.install();
        let sink = Arc::new(MockErrorSink::failing());
        let reporter = reporter(Some(sink.clone()));
        let raw = InboundMessage::new("events", 0, 1, "{}");

        reporter.report(&ReportedError::new("boom", ""), &raw).await;

        let retries = logs.matching(Level::WARN, "Error event publish failed, will retry");
        assert_eq!(retries.len(), sink.attempts());
        assert_eq!(logs.count_at(Level::ERROR), 1);
        assert_eq!(logs.matching(Level::ERROR, "Cannot publish error event").len(), 1);
    }

    #[tokio::test]
    async fn test_report_without_sink_is_noop() {
        let reporter = reporter(None);
        assert!(!reporter.is_enabled());
        let raw = InboundMessage::new("events", 0, 1, "{}");
        assert!(!reporter.report(&ReportedError::new("boom", ""), &raw).await);
    }
}
