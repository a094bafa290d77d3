//! Consumer wrapper library
//!
//! A reusable Kafka consumption engine. Services supply typed handlers; the
//! engine owns polling, ordering, commit timing, failure isolation and error
//! republishing.

pub mod api;
pub mod config;
pub mod consumer;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod kafka;
pub mod logging;
pub mod models;

#[doc(hidden)]
pub mod test_utils;

// Re-export commonly used types at the crate root
pub use config::Config;
pub use error::{Error, Result};

pub use consumer::{
    CancellationToken, Consumer, ConsumerOptions, ConsumerState, HandlerFailurePolicy, RunOptions,
};
pub use db::{Dependencies, DependencyOptions, DocumentStore, NotificationChannel};
pub use dispatch::{DispatchReport, Dispatcher, HandlerFailure};
pub use handlers::{Handler, HandlerError, HandlerTable};
pub use kafka::{ErrorReporter, ErrorSink, KafkaConfig, MessageBroker, ReportedError};
pub use models::{ErrorRecord, Event, EventCodec, InboundMessage, JsonCodec, TaggedEvent};

// Re-export health check types
pub use api::{ComponentHealth, HealthState, HealthStatus};
