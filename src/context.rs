//! Invocation context and the adapter that pulls broker objects out of it.
//!
//! The hosting runtime describes each invocation with binding metadata: which parameters are
//! inputs, which one is the trigger, and how the trigger is connected. Bound values (the received
//! message, the message-actions handle) are materialized lazily through an [`InputBinder`].
//!
//! [`ContextAdapter`] is the seam policies use to reach those values. [`DefaultContextAdapter`]
//! implements the lookup rules below; hosts with a different binding model supply their own.
//!
//! - The received message is bound from the first input binding whose type is
//!   [`TRIGGER_BINDING_TYPE`].
//! - Message actions are bound through a synthetic binding named
//!   [`MESSAGE_ACTIONS_BINDING_NAME`] of type [`MESSAGE_ACTIONS_BINDING_TYPE`].

use crate::broker::{run_cancellable, MessageActions};
use crate::error::{BrokerError, PolicyError};
use crate::message::ReceivedMessage;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Binding type of the broker trigger.
pub const TRIGGER_BINDING_TYPE: &str = "serviceBusTrigger";
/// Suffix shared by every trigger binding type.
pub const TRIGGER_BINDING_SUFFIX: &str = "Trigger";
/// Name of the synthetic binding used to materialize message actions.
pub const MESSAGE_ACTIONS_BINDING_NAME: &str = "messageActions";
/// Type of the synthetic binding used to materialize message actions.
pub const MESSAGE_ACTIONS_BINDING_TYPE: &str = "ServiceBusMessageActions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingDirection {
    In,
    Out,
    InOut,
}

/// Describes one binding of a function.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindingMetadata {
    pub name: String,
    pub binding_type: String,
    pub direction: BindingDirection,
}

impl BindingMetadata {
    pub fn new(
        name: impl Into<String>,
        binding_type: impl Into<String>,
        direction: BindingDirection,
    ) -> Self {
        Self { name: name.into(), binding_type: binding_type.into(), direction }
    }

    /// Input binding of the broker trigger type.
    pub fn trigger(name: impl Into<String>) -> Self {
        Self::new(name, TRIGGER_BINDING_TYPE, BindingDirection::In)
    }

    fn message_actions() -> Self {
        Self::new(MESSAGE_ACTIONS_BINDING_NAME, MESSAGE_ACTIONS_BINDING_TYPE, BindingDirection::In)
    }
}

/// Connection details declared on the trigger parameter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerMetadata {
    /// Name of the app setting that resolves to the broker connection.
    pub connection: Option<String>,
    pub queue_name: Option<String>,
    pub topic_name: Option<String>,
    pub subscription_name: Option<String>,
}

impl TriggerMetadata {
    pub fn queue(queue_name: impl Into<String>, connection: impl Into<String>) -> Self {
        Self {
            connection: Some(connection.into()),
            queue_name: Some(queue_name.into()),
            ..Self::default()
        }
    }

    pub fn topic(
        topic_name: impl Into<String>,
        subscription_name: impl Into<String>,
        connection: impl Into<String>,
    ) -> Self {
        Self {
            connection: Some(connection.into()),
            topic_name: Some(topic_name.into()),
            subscription_name: Some(subscription_name.into()),
            ..Self::default()
        }
    }

    /// Where retries are scheduled: the topic if set, otherwise the queue.
    pub fn destination(&self) -> Option<&str> {
        self.topic_name.as_deref().or(self.queue_name.as_deref())
    }

    /// Connection name, ignoring empty or whitespace values.
    pub fn connection_name(&self) -> Option<&str> {
        self.connection.as_deref().filter(|c| !c.trim().is_empty())
    }
}

/// A value produced by binding an input.
#[derive(Debug, Clone)]
pub enum BoundValue {
    Message(Box<ReceivedMessage>),
    Actions(Arc<dyn MessageActions>),
}

/// Materializes bound values on demand.
#[async_trait]
pub trait InputBinder: Send + Sync + fmt::Debug {
    /// Bind `binding`. `Ok(None)` means the host has no value for it.
    async fn bind(
        &self,
        binding: &BindingMetadata,
        cancel: &CancellationToken,
    ) -> Result<Option<BoundValue>, BrokerError>;
}

/// Binder with nothing to bind.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyBinder;

#[async_trait]
impl InputBinder for EmptyBinder {
    async fn bind(
        &self,
        _binding: &BindingMetadata,
        _cancel: &CancellationToken,
    ) -> Result<Option<BoundValue>, BrokerError> {
        Ok(None)
    }
}

#[derive(Debug)]
struct ContextInner {
    invocation_id: String,
    function_name: String,
    input_bindings: Vec<BindingMetadata>,
    trigger: Option<TriggerMetadata>,
    binder: Arc<dyn InputBinder>,
    cancellation: CancellationToken,
}

/// Everything known about a single function invocation. Cheap to clone.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    inner: Arc<ContextInner>,
}

impl InvocationContext {
    pub fn builder(function_name: impl Into<String>) -> InvocationContextBuilder {
        InvocationContextBuilder::new(function_name)
    }

    pub fn invocation_id(&self) -> &str {
        &self.inner.invocation_id
    }

    pub fn function_name(&self) -> &str {
        &self.inner.function_name
    }

    pub fn input_bindings(&self) -> &[BindingMetadata] {
        &self.inner.input_bindings
    }

    pub fn trigger(&self) -> Option<&TriggerMetadata> {
        self.inner.trigger.as_ref()
    }

    /// Token threaded into every broker call made on behalf of this invocation.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancellation
    }

    /// Materialize the value for `binding` through the host's binder.
    pub async fn bind_input(&self, binding: &BindingMetadata) -> Result<Option<BoundValue>, BrokerError> {
        let cancel = self.cancellation();
        run_cancellable(cancel, self.inner.binder.bind(binding, cancel)).await
    }
}

/// Builder for [`InvocationContext`].
#[derive(Debug)]
pub struct InvocationContextBuilder {
    invocation_id: Option<String>,
    function_name: String,
    input_bindings: Vec<BindingMetadata>,
    trigger: Option<TriggerMetadata>,
    binder: Arc<dyn InputBinder>,
    cancellation: CancellationToken,
}

impl InvocationContextBuilder {
    pub fn new(function_name: impl Into<String>) -> Self {
        Self {
            invocation_id: None,
            function_name: function_name.into(),
            input_bindings: Vec::new(),
            trigger: None,
            binder: Arc::new(EmptyBinder),
            cancellation: CancellationToken::new(),
        }
    }

    /// Defaults to a random v4 UUID.
    pub fn invocation_id(mut self, id: impl Into<String>) -> Self {
        self.invocation_id = Some(id.into());
        self
    }

    /// Append an input binding. Order is preserved.
    pub fn input_binding(mut self, binding: BindingMetadata) -> Self {
        self.input_bindings.push(binding);
        self
    }

    pub fn trigger(mut self, trigger: TriggerMetadata) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn binder<B>(mut self, binder: B) -> Self
    where
        B: InputBinder + 'static,
    {
        self.binder = Arc::new(binder);
        self
    }

    pub fn shared_binder(mut self, binder: Arc<dyn InputBinder>) -> Self {
        self.binder = binder;
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn build(self) -> InvocationContext {
        InvocationContext {
            inner: Arc::new(ContextInner {
                invocation_id: self
                    .invocation_id
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                function_name: self.function_name,
                input_bindings: self.input_bindings,
                trigger: self.trigger,
                binder: self.binder,
                cancellation: self.cancellation,
            }),
        }
    }
}

/// First input binding of the broker trigger type.
pub fn trigger_binding(bindings: &[BindingMetadata]) -> Option<&BindingMetadata> {
    bindings.iter().find(|b| b.binding_type == TRIGGER_BINDING_TYPE)
}

/// True when the invocation was started by the broker trigger.
///
/// Looks at the first binding whose type ends in `Trigger` and requires an exact type match.
/// Hosts use this as the predicate for attaching delivery policies.
pub fn is_broker_trigger(context: &InvocationContext) -> bool {
    context
        .input_bindings()
        .iter()
        .find(|b| b.binding_type.ends_with(TRIGGER_BINDING_SUFFIX))
        .map(|b| b.binding_type == TRIGGER_BINDING_TYPE)
        .unwrap_or(false)
}

/// Extracts broker objects from an invocation context.
#[async_trait]
pub trait ContextAdapter: Send + Sync + fmt::Debug {
    /// The message that triggered the invocation, if one is bound.
    async fn received_message(
        &self,
        context: &InvocationContext,
    ) -> Result<Option<ReceivedMessage>, PolicyError>;

    /// The settlement handle for the received message, if the host provides one.
    async fn message_actions(
        &self,
        context: &InvocationContext,
    ) -> Result<Option<Arc<dyn MessageActions>>, PolicyError>;

    /// Connection and destination declared on the trigger.
    fn trigger_metadata(&self, context: &InvocationContext) -> Option<TriggerMetadata> {
        context.trigger().cloned()
    }
}

/// Binding-metadata based adapter.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultContextAdapter;

#[async_trait]
impl ContextAdapter for DefaultContextAdapter {
    async fn received_message(
        &self,
        context: &InvocationContext,
    ) -> Result<Option<ReceivedMessage>, PolicyError> {
        let Some(binding) = trigger_binding(context.input_bindings()) else {
            return Ok(None);
        };
        match context.bind_input(binding).await? {
            None => Ok(None),
            Some(BoundValue::Message(message)) => Ok(Some(*message)),
            Some(BoundValue::Actions(_)) => Err(BrokerError::Binding {
                binding: binding.name.clone(),
                message: "expected a received message, got message actions".to_string(),
            }
            .into()),
        }
    }

    async fn message_actions(
        &self,
        context: &InvocationContext,
    ) -> Result<Option<Arc<dyn MessageActions>>, PolicyError> {
        let binding = BindingMetadata::message_actions();
        match context.bind_input(&binding).await? {
            None => Ok(None),
            Some(BoundValue::Actions(actions)) => Ok(Some(actions)),
            Some(BoundValue::Message(_)) => Err(BrokerError::Binding {
                binding: binding.name,
                message: "expected message actions, got a received message".to_string(),
            }
            .into()),
        }
    }
}
