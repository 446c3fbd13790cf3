//! Messages as seen by the failure-handling layer.
//!
//! [`ReceivedMessage`] is what the broker delivered to the handler. It is read-only here: the
//! broker owns its delivery count. [`OutgoingMessage`] is a fresh message handed back to the
//! broker when a retry is scheduled; it copies the received body and properties.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Value stored in a message's application property bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
}

impl PropertyValue {
    /// Short type description used in validation errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::Bool(_) => "a boolean",
            PropertyValue::Int(_) => "an integer",
            PropertyValue::Double(_) => "a double",
            PropertyValue::String(_) => "a string",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(v) => write!(f, "{}", v),
            PropertyValue::Int(v) => write!(f, "{}", v),
            PropertyValue::Double(v) => write!(f, "{}", v),
            PropertyValue::String(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        PropertyValue::Int(i64::from(v))
    }
}

impl From<u32> for PropertyValue {
    fn from(v: u32) -> Self {
        PropertyValue::Int(i64::from(v))
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Double(v)
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_string())
    }
}

/// Application property bag, shared by the application and the retry envelope.
pub type Properties = BTreeMap<String, PropertyValue>;

/// Broker-level headers copied verbatim when a message is cloned for retry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeaders {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub subject: Option<String>,
    pub session_id: Option<String>,
    pub partition_key: Option<String>,
    pub reply_to: Option<String>,
    pub to: Option<String>,
    pub time_to_live: Option<Duration>,
}

/// A message delivered by the broker to a handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    message_id: String,
    body: Vec<u8>,
    delivery_count: u32,
    sequence_number: i64,
    headers: MessageHeaders,
    properties: Properties,
}

impl ReceivedMessage {
    pub fn new(message_id: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            message_id: message_id.into(),
            body: body.into(),
            delivery_count: 1,
            sequence_number: 0,
            headers: MessageHeaders::default(),
            properties: Properties::new(),
        }
    }

    /// Set the broker-reported delivery count (first delivery is `1`).
    pub fn with_delivery_count(mut self, delivery_count: u32) -> Self {
        self.delivery_count = delivery_count;
        self
    }

    pub fn with_sequence_number(mut self, sequence_number: i64) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    pub fn with_headers(mut self, headers: MessageHeaders) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn sequence_number(&self) -> i64 {
        self.sequence_number
    }

    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }
}

/// A message to hand to the broker, typically a clone of a received message.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub message_id: String,
    pub body: Vec<u8>,
    pub headers: MessageHeaders,
    pub properties: Properties,
}

impl OutgoingMessage {
    pub fn new(message_id: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            message_id: message_id.into(),
            body: body.into(),
            headers: MessageHeaders::default(),
            properties: Properties::new(),
        }
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }
}

impl From<&ReceivedMessage> for OutgoingMessage {
    /// Copies id, body, headers and every application property.
    fn from(received: &ReceivedMessage) -> Self {
        Self {
            message_id: received.message_id.clone(),
            body: received.body.clone(),
            headers: received.headers.clone(),
            properties: received.properties.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn received_defaults_to_first_delivery() {
        let msg = ReceivedMessage::new("m-1", b"payload".to_vec());
        assert_eq!(msg.delivery_count(), 1);
        assert_eq!(msg.message_id(), "m-1");
        assert_eq!(msg.body(), b"payload");
        assert!(msg.properties().is_empty());
    }

    #[test]
    fn outgoing_copies_everything() {
        let headers = MessageHeaders {
            content_type: Some("application/json".into()),
            correlation_id: Some("corr".into()),
            session_id: Some("s-1".into()),
            time_to_live: Some(Duration::from_secs(60)),
            ..MessageHeaders::default()
        };
        let msg = ReceivedMessage::new("m-1", "{}")
            .with_headers(headers.clone())
            .with_property("tenant", "acme")
            .with_property("priority", 3);

        let out = OutgoingMessage::from(&msg);
        assert_eq!(out.message_id, "m-1");
        assert_eq!(out.body, b"{}".to_vec());
        assert_eq!(out.headers, headers);
        assert_eq!(out.property("tenant"), Some(&PropertyValue::from("acme")));
        assert_eq!(out.property("priority"), Some(&PropertyValue::Int(3)));
    }

    #[test]
    fn property_values_round_trip_through_json() {
        let mut props = Properties::new();
        props.insert("a".into(), PropertyValue::Int(2));
        props.insert("b".into(), PropertyValue::from("x"));
        props.insert("c".into(), PropertyValue::Bool(true));
        let json = serde_json::to_string(&props).unwrap();
        let back: Properties = serde_json::from_str(&json).unwrap();
        assert_eq!(back, props);
    }

    #[test]
    fn accessors_are_type_strict() {
        assert_eq!(PropertyValue::Int(4).as_int(), Some(4));
        assert_eq!(PropertyValue::from("4").as_int(), None);
        assert_eq!(PropertyValue::from("4").as_str(), Some("4"));
        assert_eq!(PropertyValue::Double(1.5).type_name(), "a double");
    }
}
