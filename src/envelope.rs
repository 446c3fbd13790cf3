//! Retry metadata carried inside a message's property bag.
//!
//! Scheduled retries thread two values through every clone of a message:
//!
//! - [`DELIVERY_ATTEMPTS_KEY`]: this layer's own attempt counter. Independent of the broker's
//!   delivery count, which restarts for every scheduled clone.
//! - [`ORIGINAL_MESSAGE_ID_KEY`]: id of the first message in the retry chain. Written once and
//!   never replaced by later clones.
//!
//! The property keys are a wire contract shared with every other consumer of the queue and must
//! not change. Values are validated when read: a counter stored as a string is an error, not a
//! silent zero.

use crate::error::EnvelopeError;
use crate::message::{OutgoingMessage, Properties, PropertyValue, ReceivedMessage};

/// Property key holding the attempt counter (integer).
pub const DELIVERY_ATTEMPTS_KEY: &str = "ScheduledRetryMiddleware.DeliveryAttempts";
/// Property key holding the first message id of the retry chain (string).
pub const ORIGINAL_MESSAGE_ID_KEY: &str = "ScheduledRetryMiddleware.OriginalMessageId";
/// Property key holding the envelope layout version (integer). Absent means version 1.
pub const ENVELOPE_VERSION_KEY: &str = "ScheduledRetryMiddleware.EnvelopeVersion";
/// Highest envelope version this crate reads and the version it writes.
pub const ENVELOPE_VERSION: u32 = 1;

/// Typed view of the retry metadata on a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEnvelope {
    version: u32,
    delivery_attempts: u32,
    original_message_id: Option<String>,
}

impl Default for RetryEnvelope {
    /// An untouched message: first attempt, no chain yet.
    fn default() -> Self {
        Self { version: ENVELOPE_VERSION, delivery_attempts: 1, original_message_id: None }
    }
}

impl RetryEnvelope {
    /// Read and validate the envelope from a received message.
    pub fn read(message: &ReceivedMessage) -> Result<Self, EnvelopeError> {
        Self::from_properties(message.properties())
    }

    /// Read and validate the envelope from a raw property bag.
    pub fn from_properties(properties: &Properties) -> Result<Self, EnvelopeError> {
        let version = match properties.get(ENVELOPE_VERSION_KEY) {
            None => ENVELOPE_VERSION,
            Some(value) => {
                let v = expect_int(ENVELOPE_VERSION_KEY, value)?;
                if v > i64::from(ENVELOPE_VERSION) {
                    return Err(EnvelopeError::UnsupportedVersion {
                        found: v,
                        supported: ENVELOPE_VERSION,
                    });
                }
                if v < 1 {
                    return Err(EnvelopeError::OutOfRange { key: ENVELOPE_VERSION_KEY, value: v });
                }
                v as u32
            }
        };

        let delivery_attempts = match properties.get(DELIVERY_ATTEMPTS_KEY) {
            None => 1,
            Some(value) => {
                let v = expect_int(DELIVERY_ATTEMPTS_KEY, value)?;
                u32::try_from(v)
                    .map_err(|_| EnvelopeError::OutOfRange { key: DELIVERY_ATTEMPTS_KEY, value: v })?
            }
        };

        let original_message_id = match properties.get(ORIGINAL_MESSAGE_ID_KEY) {
            None => None,
            Some(PropertyValue::String(id)) => Some(id.clone()),
            Some(other) => {
                return Err(EnvelopeError::InvalidType {
                    key: ORIGINAL_MESSAGE_ID_KEY,
                    expected: "a string",
                    found: other.type_name(),
                })
            }
        };

        Ok(Self { version, delivery_attempts, original_message_id })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Attempt counter; `1` for a message that has never been rescheduled.
    pub fn delivery_attempts(&self) -> u32 {
        self.delivery_attempts
    }

    /// Original id recorded on the message, if any.
    pub fn original_message_id(&self) -> Option<&str> {
        self.original_message_id.as_deref()
    }

    /// Envelope for the next clone: counter incremented, chain id seeded from `current_message_id`
    /// only when none was recorded yet.
    pub fn next(&self, current_message_id: &str) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            delivery_attempts: self.delivery_attempts.saturating_add(1),
            original_message_id: Some(
                self.original_message_id.clone().unwrap_or_else(|| current_message_id.to_string()),
            ),
        }
    }

    /// Write the envelope keys into `properties`, replacing any previous values.
    pub fn write_to(&self, properties: &mut Properties) {
        properties.insert(ENVELOPE_VERSION_KEY.to_string(), PropertyValue::from(self.version));
        properties.insert(
            DELIVERY_ATTEMPTS_KEY.to_string(),
            PropertyValue::from(self.delivery_attempts),
        );
        if let Some(id) = &self.original_message_id {
            properties.insert(ORIGINAL_MESSAGE_ID_KEY.to_string(), PropertyValue::from(id.as_str()));
        }
    }

    /// Clone `received` and stamp this envelope onto the copy.
    pub fn stamp(&self, received: &ReceivedMessage) -> OutgoingMessage {
        let mut message = OutgoingMessage::from(received);
        self.write_to(&mut message.properties);
        message
    }
}

fn expect_int(key: &'static str, value: &PropertyValue) -> Result<i64, EnvelopeError> {
    value.as_int().ok_or(EnvelopeError::InvalidType {
        key,
        expected: "an integer",
        found: value.type_name(),
    })
}

/// Clone a received message for its next scheduled retry.
///
/// The clone carries `DeliveryAttempts = current + 1` and the chain's original message id.
pub fn clone_for_retry(received: &ReceivedMessage) -> Result<OutgoingMessage, EnvelopeError> {
    let envelope = RetryEnvelope::read(received)?;
    Ok(envelope.next(received.message_id()).stamp(received))
}
