//! Inbound event envelope.
//!
//! Every frame on the wire is a single JSON object
//! `{"type": string, "eventType"?: string, "data"?: object}`. Only frames
//! whose `type` is `"event"` are routed through the dispatcher.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::TransportError;

/// Message type carried by frames that are routed to the dispatcher.
pub const EVENT_MESSAGE_TYPE: &str = "event";

/// A typed event parsed from one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Envelope message type (`"event"` for routable frames).
    #[serde(rename = "type", default)]
    pub message_type: String,

    /// Event type used for handler lookup.
    #[serde(
        rename = "eventType",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub event_type: String,

    /// Event payload. Absent or `null` data parses as an empty map.
    #[serde(default, deserialize_with = "object_or_null")]
    pub data: Map<String, Value>,
}

fn object_or_null<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Event {
    /// Creates a routable event of the given type.
    #[must_use]
    pub fn new(event_type: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            message_type: EVENT_MESSAGE_TYPE.to_string(),
            event_type: event_type.into(),
            data,
        }
    }

    /// Parses a raw text frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::MalformedFrame`] when the text is not JSON,
    /// is not an object, or carries a non-object `data` field.
    pub fn parse(raw: &str) -> Result<Self, TransportError> {
        serde_json::from_str(raw).map_err(|e| TransportError::MalformedFrame(e.to_string()))
    }

    /// Returns `true` when this frame should be routed to the dispatcher.
    #[must_use]
    pub fn is_routable(&self) -> bool {
        self.message_type == EVENT_MESSAGE_TYPE
    }

    /// Serializes the event back into its wire form.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
