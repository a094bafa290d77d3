//! Decoded event model and the codec seam
//!
//! The engine never builds events itself. It hands parsed JSON to an
//! [`EventCodec`] and routes whatever comes back by its type tag.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::marker::PhantomData;

use crate::error::{Error, Result};

/// A decoded, tagged event
pub trait Event: Send + Sync + 'static {
    /// Discriminant used to route the event to handlers
    fn event_type(&self) -> &str;
}

/// Pure decode/encode pair for the wire payload
pub trait EventCodec: Send + Sync + 'static {
    type Event: Event;

    /// Decode parsed JSON into an event, failing on an unknown or malformed discriminant
    fn decode(&self, value: Value) -> Result<Self::Event>;

    /// Encode a payload under the given kind
    fn encode(&self, kind: &str, payload: Value) -> Result<Value>;
}

/// Codec for any serde type, typically an internally tagged enum
///
/// ```ignore
/// #[derive(Deserialize)]
/// #[serde(tag = "type")]
/// enum AccountEvent { Opened { id: String }, Closed { id: String } }
/// ```
pub struct JsonCodec<E> {
    tag_field: &'static str,
    _event: PhantomData<fn() -> E>,
}

impl<E> JsonCodec<E> {
    pub fn new() -> Self {
        Self {
            tag_field: "type",
            _event: PhantomData,
        }
    }

    /// Use a different field name for the discriminant when encoding
    pub fn with_tag_field(mut self, tag_field: &'static str) -> Self {
        self.tag_field = tag_field;
        self
    }
}

impl<E> Default for JsonCodec<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventCodec for JsonCodec<E>
where
    E: Event + DeserializeOwned,
{
    type Event = E;

    fn decode(&self, value: Value) -> Result<E> {
        serde_json::from_value(value).map_err(|e| Error::decode(e.to_string()))
    }

    fn encode(&self, kind: &str, payload: Value) -> Result<Value> {
        let mut object = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(Error::internal(format!(
                    "cannot encode non-object payload as '{}': {}",
                    kind, other
                )))
            },
        };
        object.insert(self.tag_field.to_string(), Value::String(kind.to_string()));
        Ok(Value::Object(object))
    }
}

/// Untyped event: the discriminant plus every other field
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct TaggedEvent {
    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Event for TaggedEvent {
    fn event_type(&self) -> &str {
        &self.event_type
    }
}
