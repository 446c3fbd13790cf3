//! Decision strategies for failed invocations.
//!
//! A strategy looks at the failed message and the handler error and either claims the failure
//! with a [`Decision`] or passes (`None`). A [`DeliveryPolicy`](crate::DeliveryPolicy) asks its
//! strategies in order and acts on the first decision; when every strategy passes, the failure is
//! left to the broker's native redelivery.

use crate::backoff::Backoff;
use crate::config::{ExceptionInsightOptions, RetryOptions};
use crate::envelope::RetryEnvelope;
use crate::error::PolicyError;
use crate::message::ReceivedMessage;
use std::error::Error;
use std::fmt;
use std::time::Duration;

/// What to do with a failed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Suppress the failure without touching the broker.
    Handled,
    /// Move the message to the dead-letter queue.
    DeadLetter { reason: String },
    /// Schedule a clone carrying `envelope` to be delivered after `delay`.
    Reschedule { delay: Duration, envelope: RetryEnvelope },
}

/// A failed invocation as seen by a strategy.
#[derive(Clone, Copy)]
pub struct Failure<'a> {
    pub message: &'a ReceivedMessage,
    pub error: &'a (dyn Error + Send + Sync + 'static),
}

impl fmt::Debug for Failure<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Failure")
            .field("message_id", &self.message.message_id())
            .field("error", &self.error.to_string())
            .finish()
    }
}

/// Decides what happens to a failed message.
pub trait DecisionStrategy: Send + Sync + fmt::Debug {
    fn decide(&self, failure: &Failure<'_>) -> Result<Option<Decision>, PolicyError>;
}

/// Dead-letter reason recorded for an exhausted message.
pub fn retried_reason(times: u32) -> String {
    format!("Message has been retried {} times", times)
}

/// Dead-letters once the broker-reported delivery count reaches the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryCountCeiling {
    max_delivery_count: u32,
}

impl DeliveryCountCeiling {
    pub fn new(options: ExceptionInsightOptions) -> Self {
        Self { max_delivery_count: options.max_delivery_count() }
    }
}

impl DecisionStrategy for DeliveryCountCeiling {
    fn decide(&self, failure: &Failure<'_>) -> Result<Option<Decision>, PolicyError> {
        let delivery_count = failure.message.delivery_count();
        if delivery_count >= self.max_delivery_count {
            return Ok(Some(Decision::DeadLetter { reason: retried_reason(delivery_count) }));
        }
        Ok(None)
    }
}

/// Reschedules with backoff until the retry envelope's attempt counter reaches the ceiling,
/// then dead-letters.
///
/// Always decides; nothing placed after it in a policy is consulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledRetry {
    max_delivery_count: u32,
    backoff: Backoff,
}

impl ScheduledRetry {
    pub fn new(options: &RetryOptions) -> Self {
        Self { max_delivery_count: options.max_delivery_count(), backoff: options.backoff() }
    }
}

impl DecisionStrategy for ScheduledRetry {
    fn decide(&self, failure: &Failure<'_>) -> Result<Option<Decision>, PolicyError> {
        let envelope = RetryEnvelope::read(failure.message)?;
        let attempts = envelope.delivery_attempts();
        if attempts < self.max_delivery_count {
            let delay = self.backoff.delay(attempts.max(1));
            let next = envelope.next(failure.message.message_id());
            return Ok(Some(Decision::Reschedule { delay, envelope: next }));
        }
        Ok(Some(Decision::DeadLetter { reason: retried_reason(attempts) }))
    }
}

/// Strategy backed by a closure.
pub struct FnStrategy<F> {
    name: &'static str,
    decide: F,
}

impl<F> fmt::Debug for FnStrategy<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStrategy").field("name", &self.name).finish()
    }
}

impl<F> DecisionStrategy for FnStrategy<F>
where
    F: Fn(&Failure<'_>) -> Result<Option<Decision>, PolicyError> + Send + Sync,
{
    fn decide(&self, failure: &Failure<'_>) -> Result<Option<Decision>, PolicyError> {
        (self.decide)(failure)
    }
}

/// Build a strategy from a closure, e.g. to dead-letter poison messages immediately.
pub fn from_fn<F>(name: &'static str, decide: F) -> FnStrategy<F>
where
    F: Fn(&Failure<'_>) -> Result<Option<Decision>, PolicyError> + Send + Sync,
{
    FnStrategy { name, decide }
}
