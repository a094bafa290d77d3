//! Error handling module for the consumer wrapper
//!
//! This module defines the error types used throughout the crate.

use thiserror::Error;

/// Result type alias for consumer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the consumer wrapper
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Broker session could not be established
    #[error("Kafka connection error: {0}")]
    Connection(String),

    /// Fetching a batch from the broker failed
    #[error("Kafka poll error: {0}")]
    Poll(String),

    /// Committing an offset failed
    #[error("Kafka commit error: {0}")]
    Commit(String),

    /// Other Kafka related errors
    #[error("Kafka error: {0}")]
    Kafka(String),

    /// The payload could not be decoded into an event
    #[error("Decode error: {0}")]
    Decode(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A required dependency was not supplied
    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    /// Document store or notification channel errors
    #[error("Store error: {0}")]
    Store(String),

    /// A handler failed while the consumer runs with the abort policy
    #[error("Handler '{handler_name}' failed, batch aborted: {message}")]
    HandlerAborted {
        handler_name: String,
        message: String,
    },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    /// Create a Kafka error
    pub fn kafka<S: Into<String>>(msg: S) -> Self {
        Error::Kafka(msg.into())
    }

    /// Create a decode error
    pub fn decode<S: Into<String>>(msg: S) -> Self {
        Error::Decode(msg.into())
    }

    /// Create a store error
    pub fn store<S: Into<String>>(msg: S) -> Self {
        Error::Store(msg.into())
    }

    /// Create a missing dependency error
    pub fn missing_dependency<S: Into<String>>(msg: S) -> Self {
        Error::MissingDependency(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }
}

/// Convert from anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

/// Convert from envconfig::Error to our Error type
impl From<envconfig::Error> for Error {
    fn from(err: envconfig::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<rdkafka::error::KafkaError> for Error {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        Error::Kafka(err.to_string())
    }
}

impl From<mongodb::error::Error> for Error {
    fn from(err: mongodb::error::Error) -> Self {
        Error::Store(format!("mongodb: {}", err))
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Store(format!("redis: {}", err))
    }
}
