//! Data models for the consumer wrapper
//!
//! This module contains the message, event and error-record types that flow
//! through the consumption loop, plus the codec seam used to decode events.

pub mod error_record;
pub mod event;
pub mod message;

// Re-export commonly used types
pub use error_record::ErrorRecord;
pub use event::{Event, EventCodec, JsonCodec, TaggedEvent};
pub use message::InboundMessage;
