//! Routes one decoded event to its handlers
//!
//! Every matching handler runs in registration order. A failing handler is
//! logged and recorded, the remaining handlers still run. Each success
//! publishes a `{consumer}:{event_type}` notification when a channel is set.

use tracing::{error, info, warn};

use crate::db::Dependencies;
use crate::handlers::{attributed_handler, HandlerTable};
use crate::logging::CONSUMER_TAG;
use crate::models::{Event, InboundMessage};

/// A handler that returned an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub handler_name: String,
    pub message: String,
    pub stack: String,
}

/// Outcome of dispatching one event
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Handlers that were invoked
    pub attempted: usize,

    /// Handlers that failed, in invocation order
    pub failures: Vec<HandlerFailure>,
}

impl DispatchReport {
    pub fn succeeded(&self) -> usize {
        self.attempted - self.failures.len()
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

pub struct Dispatcher<E> {
    consumer: String,
    table: HandlerTable<E>,
}

impl<E: Event> Dispatcher<E> {
    pub fn new(consumer: impl Into<String>, table: HandlerTable<E>) -> Self {
        Self {
            consumer: consumer.into(),
            table,
        }
    }

    pub fn table(&self) -> &HandlerTable<E> {
        &self.table
    }

    /// Invoke every handler registered for the event's type
    pub async fn handle(
        &self,
        dependencies: &Dependencies,
        event: &E,
        raw: &InboundMessage,
    ) -> DispatchReport {
        let event_type = event.event_type();
        let handlers = self.table.lookup(event_type);

        if handlers.is_empty() {
            info!(
                consumer = %self.consumer,
                tags = CONSUMER_TAG,
                event_type,
                "No handler found."
            );
            return DispatchReport::default();
        }

        let mut report = DispatchReport {
            attempted: handlers.len(),
            failures: Vec::new(),
        };

        for handler in handlers {
            match handler.handle(dependencies, event, raw).await {
                Ok(()) => self.notify(dependencies, event_type, raw).await,
                Err(err) => {
                    let handler_name = attributed_handler(&err)
                        .unwrap_or_else(|| handler.name())
                        .to_string();
                    let stack = format!("{:?}", err);

                    error!(
                        consumer = %self.consumer,
                        tags = CONSUMER_TAG,
                        event_type,
                        handler_name = %handler_name,
                        error = %err,
                        stack = %stack,
                        payload = %raw.payload_str(),
                        "Cannot handle DTO"
                    );

                    report.failures.push(HandlerFailure {
                        handler_name,
                        message: err.to_string(),
                        stack,
                    });
                },
            }
        }

        report
    }

    async fn notify(&self, dependencies: &Dependencies, event_type: &str, raw: &InboundMessage) {
        let Some(channel) = dependencies.redis.as_ref() else {
            return;
        };

        let name = format!("{}:{}", self.consumer, event_type);
        if let Err(err) = channel.publish(&name, &raw.payload_str()).await {
            warn!(
                consumer = %self.consumer,
                tags = CONSUMER_TAG,
                event_type,
                channel = %name,
                error = %err,
                "Cannot publish notification"
            );
        }
    }
}
