//! Kafka integration module
//!
//! This module provides:
//! - The broker capability driven by the consumption loop, with an rdkafka session
//! - A producer for the dedicated error topic
//! - The error reporter that republishes failures to that topic

mod broker;
mod config;
mod producer;
mod reporter;

pub use broker::{KafkaBroker, MessageBroker};
pub use config::KafkaConfig;
pub use producer::{ErrorProducer, ErrorSink};
pub use reporter::{ErrorReporter, ReportedError};
