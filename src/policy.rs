//! Delivery policies: exception hooks that settle a failed message with the broker.
//!
//! A [`DeliveryPolicy`] asks its [`DecisionStrategy`] list what to do with a failure, then
//! carries the decision out:
//!
//! - `DeadLetter`: dead-letter through the message-actions capability, with the handler error's
//!   message as description.
//! - `Reschedule`: clone the message with the new retry envelope, resolve a client for the
//!   trigger's connection and schedule the clone on the trigger's topic (or queue). The sender is
//!   closed on every path.
//! - `Handled`: suppress the failure.
//! - no decision: leave the failure to the broker's native redelivery.
//!
//! Two presets match the two shipped policies:
//!
//! | preset | strategies | message actions |
//! |---|---|---|
//! | [`DeliveryPolicy::exception_insight`] | [`DeliveryCountCeiling`] | required up front |
//! | [`DeliveryPolicy::scheduled_retry`] | [`ScheduledRetry`] | only when dead-lettering |
//!
//! Broker failures while settling are returned as [`PolicyError`] and are never retried here.

use crate::broker::{run_cancellable, MessageActions};
use crate::client::ClientResolver;
use crate::clock::{add_saturating, Clock, SystemClock};
use crate::config::{ExceptionInsightOptions, RetryOptions};
use crate::context::{ContextAdapter, InvocationContext};
use crate::decision::{Decision, DecisionStrategy, DeliveryCountCeiling, Failure, ScheduledRetry};
use crate::envelope::RetryEnvelope;
use crate::error::{Capability, PolicyError};
use crate::message::ReceivedMessage;
use crate::pipeline::InvocationHooks;
use crate::telemetry::{emit_best_effort, DeliveryEvent, NullSink, TelemetrySink};
use async_trait::async_trait;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Name reported by the delivery-count ceiling preset.
pub const EXCEPTION_INSIGHT_NAME: &str = "ExceptionInsightMiddleware";
/// Name reported by the scheduled retry preset.
pub const SCHEDULED_RETRY_NAME: &str = "ScheduledRetryMiddleware";

/// Exception hook that settles failed messages according to its strategies.
#[derive(Clone)]
pub struct DeliveryPolicy<S = NullSink> {
    name: &'static str,
    strategies: Vec<Arc<dyn DecisionStrategy>>,
    adapter: Arc<dyn ContextAdapter>,
    resolver: Option<Arc<dyn ClientResolver>>,
    clock: Arc<dyn Clock>,
    sink: S,
    eager_actions: bool,
}

impl<S> fmt::Debug for DeliveryPolicy<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryPolicy")
            .field("name", &self.name)
            .field("strategies", &self.strategies)
            .field("adapter", &self.adapter)
            .field("resolver", &self.resolver)
            .field("clock", &self.clock)
            .field("eager_actions", &self.eager_actions)
            .finish()
    }
}

impl DeliveryPolicy<NullSink> {
    /// Policy with no strategies; every failure is left unhandled until strategies are added.
    pub fn new(name: &'static str, adapter: Arc<dyn ContextAdapter>) -> Self {
        Self {
            name,
            strategies: Vec::new(),
            adapter,
            resolver: None,
            clock: Arc::new(SystemClock),
            sink: NullSink,
            eager_actions: false,
        }
    }

    /// Dead-letter once the broker's delivery count reaches `options.max_delivery_count()`.
    ///
    /// Message actions are resolved before the count is checked, so a host that cannot supply
    /// them fails on every handler error.
    pub fn exception_insight(
        options: ExceptionInsightOptions,
        adapter: Arc<dyn ContextAdapter>,
    ) -> Self {
        Self::new(EXCEPTION_INSIGHT_NAME, adapter)
            .with_strategy(DeliveryCountCeiling::new(options))
            .eager_actions(true)
    }

    /// Reschedule with backoff until the retry envelope is exhausted, then dead-letter.
    pub fn scheduled_retry(
        options: RetryOptions,
        adapter: Arc<dyn ContextAdapter>,
        resolver: Arc<dyn ClientResolver>,
    ) -> Self {
        Self::new(SCHEDULED_RETRY_NAME, adapter)
            .with_strategy(ScheduledRetry::new(&options))
            .with_resolver(resolver)
    }
}

impl<S> DeliveryPolicy<S> {
    /// Append a strategy. Earlier strategies take precedence.
    pub fn with_strategy<D>(mut self, strategy: D) -> Self
    where
        D: DecisionStrategy + 'static,
    {
        self.strategies.push(Arc::new(strategy));
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ClientResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Resolve message actions before deciding instead of only when dead-lettering.
    pub fn eager_actions(mut self, eager: bool) -> Self {
        self.eager_actions = eager;
        self
    }

    /// Report delivery events to `sink`.
    pub fn with_sink<S2>(self, sink: S2) -> DeliveryPolicy<S2> {
        DeliveryPolicy {
            name: self.name,
            strategies: self.strategies,
            adapter: self.adapter,
            resolver: self.resolver,
            clock: self.clock,
            sink,
            eager_actions: self.eager_actions,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

impl<S> DeliveryPolicy<S>
where
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    async fn emit(&self, event: DeliveryEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }

    async fn require_actions(
        &self,
        context: &InvocationContext,
    ) -> Result<Arc<dyn MessageActions>, PolicyError> {
        self.adapter
            .message_actions(context)
            .await?
            .ok_or(PolicyError::MissingCapability(Capability::MessageActions))
    }

    fn decide(&self, failure: &Failure<'_>) -> Result<Option<Decision>, PolicyError> {
        for strategy in &self.strategies {
            if let Some(decision) = strategy.decide(failure)? {
                return Ok(Some(decision));
            }
        }
        Ok(None)
    }

    async fn dead_letter(
        &self,
        context: &InvocationContext,
        actions: &dyn MessageActions,
        message: &ReceivedMessage,
        reason: String,
        description: String,
    ) -> Result<(), PolicyError> {
        let cancel = context.cancellation();
        run_cancellable(cancel, actions.dead_letter(message, &reason, &description, cancel)).await?;
        tracing::debug!(
            policy = self.name,
            message_id = message.message_id(),
            reason = %reason,
            "message dead-lettered"
        );
        self.emit(DeliveryEvent::DeadLettered {
            message_id: message.message_id().to_string(),
            reason,
        })
        .await;
        Ok(())
    }

    async fn reschedule(
        &self,
        context: &InvocationContext,
        message: &ReceivedMessage,
        delay: Duration,
        envelope: RetryEnvelope,
    ) -> Result<(), PolicyError> {
        let trigger = self
            .adapter
            .trigger_metadata(context)
            .ok_or(PolicyError::MissingCapability(Capability::TriggerMetadata))?;
        let connection = trigger
            .connection_name()
            .ok_or(PolicyError::MissingCapability(Capability::Connection))?;
        let destination = trigger
            .destination()
            .ok_or(PolicyError::MissingCapability(Capability::Destination))?;
        let resolver = self
            .resolver
            .as_ref()
            .ok_or(PolicyError::MissingCapability(Capability::ClientResolver))?;

        let outgoing = envelope.stamp(message);
        let enqueue_at = add_saturating(self.clock.now(), delay);

        let client = resolver.create_client(connection)?;
        let sender = client.create_sender(destination)?;
        let cancel = context.cancellation();
        let scheduled =
            run_cancellable(cancel, sender.schedule_message(outgoing, enqueue_at, cancel)).await;
        // close even when scheduling failed or was cancelled
        let closed = sender.close(cancel).await;
        let sequence_number = scheduled?;
        closed?;

        let attempt = envelope.delivery_attempts();
        tracing::debug!(
            "Message {} scheduled for delivery at {} (attempt {}) with sequenceNumber {}",
            message.message_id(),
            enqueue_at,
            attempt,
            sequence_number
        );
        self.emit(DeliveryEvent::Rescheduled {
            message_id: message.message_id().to_string(),
            original_message_id: envelope
                .original_message_id()
                .unwrap_or(message.message_id())
                .to_string(),
            attempt,
            enqueue_at,
            sequence_number,
        })
        .await;
        Ok(())
    }
}

#[async_trait]
impl<S> InvocationHooks for DeliveryPolicy<S>
where
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    fn name(&self) -> &str {
        self.name
    }

    async fn on_failure(
        &self,
        context: &InvocationContext,
        error: &(dyn Error + Send + Sync + 'static),
    ) -> Result<bool, PolicyError> {
        let Some(message) = self.adapter.received_message(context).await? else {
            tracing::warn!(
                function = context.function_name(),
                invocation_id = context.invocation_id(),
                "{} did not receive a message",
                self.name
            );
            self.emit(DeliveryEvent::MessageMissing {
                function_name: context.function_name().to_string(),
            })
            .await;
            return Ok(false);
        };

        let mut actions = if self.eager_actions {
            Some(self.require_actions(context).await?)
        } else {
            None
        };

        let decision = self.decide(&Failure { message: &message, error })?;
        match decision {
            None => {
                tracing::debug!(
                    policy = self.name,
                    message_id = message.message_id(),
                    delivery_count = message.delivery_count(),
                    "failure left to broker redelivery"
                );
                self.emit(DeliveryEvent::Unhandled { message_id: message.message_id().to_string() })
                    .await;
                Ok(false)
            }
            Some(Decision::Handled) => Ok(true),
            Some(Decision::DeadLetter { reason }) => {
                let actions = match actions.take() {
                    Some(actions) => actions,
                    None => self.require_actions(context).await?,
                };
                self.dead_letter(context, actions.as_ref(), &message, reason, error.to_string())
                    .await?;
                Ok(true)
            }
            Some(Decision::Reschedule { delay, envelope }) => {
                self.reschedule(context, &message, delay, envelope).await?;
                Ok(true)
            }
        }
    }
}
