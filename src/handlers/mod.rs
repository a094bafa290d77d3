//! Handler capability and routing
//!
//! A handler is a unit of business logic bound to one or more event types.
//! Handlers are registered once and folded into an immutable [`HandlerTable`].

mod table;

pub use table::HandlerTable;

use async_trait::async_trait;
use thiserror::Error;

use crate::db::Dependencies;
use crate::models::InboundMessage;

/// Business logic for a set of event types
#[async_trait]
pub trait Handler<E>: Send + Sync {
    /// Handler name, used to attribute failures
    fn name(&self) -> &str;

    /// Event types this handler accepts
    fn allowed_types(&self) -> Vec<String>;

    /// Process one event
    async fn handle(
        &self,
        dependencies: &Dependencies,
        event: &E,
        raw: &InboundMessage,
    ) -> anyhow::Result<()>;
}

/// Error carrying the name of the handler that raised it
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub handler_name: Option<String>,
}

impl HandlerError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            handler_name: None,
        }
    }

    /// Set the handler name
    pub fn with_handler_name<S: Into<String>>(mut self, handler_name: S) -> Self {
        self.handler_name = Some(handler_name.into());
        self
    }
}

/// Handler name attached to an error, if a [`HandlerError`] is in its chain
pub fn attributed_handler(err: &anyhow::Error) -> Option<&str> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<HandlerError>())
        .and_then(|e| e.handler_name.as_deref())
}
