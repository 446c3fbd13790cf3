#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # redelivery
//!
//! Failure handling for message-broker-triggered functions.
//!
//! When a handler fails while processing a received message, a delivery policy decides what
//! happens to the message:
//!
//! - **Exception insight**: dead-letter the message once the broker's own delivery count reaches
//!   a ceiling; below it, let the broker redeliver.
//! - **Scheduled retry**: schedule a clone of the message for later delivery with exponential,
//!   linear or constant backoff, tracking attempts in the message's properties, and dead-letter
//!   once the attempts are exhausted.
//!
//! Policies are [`InvocationHooks`] run by a [`Middleware`] around the handler; a [`Pipeline`]
//! attaches them only to broker-triggered invocations. Broker access goes through small traits
//! ([`MessageActions`], [`BrokerClient`], [`MessageSender`]) that hosts implement over their SDK.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use redelivery::{
//!     BindingMetadata, DefaultContextAdapter, InvocationContext, Pipeline, RetryOptions,
//!     StaticClientResolver,
//! };
//! # use redelivery::{BrokerClient, BrokerError, MessageSender};
//! # #[derive(Debug)]
//! # struct Client;
//! # impl BrokerClient for Client {
//! #     fn create_sender(&self, d: &str) -> Result<Box<dyn MessageSender>, BrokerError> {
//! #         Err(BrokerError::Connection { connection: d.into(), message: "offline".into() })
//! #     }
//! # }
//! # #[derive(Debug)]
//! # struct HandlerError;
//! # impl std::fmt::Display for HandlerError {
//! #     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "failed") }
//! # }
//! # impl std::error::Error for HandlerError {}
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let pipeline = Pipeline::builder()
//!     .use_scheduled_retry(
//!         RetryOptions::default(),
//!         Arc::new(DefaultContextAdapter),
//!         Arc::new(StaticClientResolver::new(Arc::new(Client))),
//!     )
//!     .build();
//!
//! let ctx = InvocationContext::builder("orders")
//!     .input_binding(BindingMetadata::trigger("message"))
//!     .build();
//!
//! // no message is bound, so the policy leaves the failure alone
//! let result = pipeline.run(ctx, |_ctx| async { Err::<(), _>(HandlerError) }).await;
//! assert!(result.unwrap_err().is_handler());
//! # });
//! ```

pub mod backoff;
pub mod broker;
pub mod client;
pub mod clock;
pub mod config;
pub mod context;
pub mod decision;
pub mod envelope;
pub mod error;
pub mod message;
pub mod pipeline;
pub mod policy;
pub mod telemetry;

// Re-exports
pub use backoff::{Backoff, BackoffMode, BackoffStrategy, MAX_BACKOFF};
pub use broker::{run_cancellable, BrokerClient, MessageActions, MessageSender};
pub use client::{
    ClientCredentials, ClientFactory, ClientResolver, ConfigClientResolver, StaticClientResolver,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use crate::config::{ConfigError, ExceptionInsightOptions, RetryOptions, RetryOptionsBuilder, Settings};
pub use context::{
    is_broker_trigger, BindingDirection, BindingMetadata, BoundValue, ContextAdapter,
    DefaultContextAdapter, InputBinder, InvocationContext, InvocationContextBuilder,
    TriggerMetadata,
};
pub use decision::{Decision, DecisionStrategy, DeliveryCountCeiling, Failure, ScheduledRetry};
pub use envelope::{clone_for_retry, RetryEnvelope};
pub use error::{BrokerError, BuildError, Capability, EnvelopeError, InvocationError, PolicyError};
pub use message::{MessageHeaders, OutgoingMessage, Properties, PropertyValue, ReceivedMessage};
pub use pipeline::{
    InvocationHooks, Middleware, MiddlewareLayer, MiddlewareService, Outcome, Pipeline,
    PipelineBuilder, PipelineStage,
};
pub use policy::DeliveryPolicy;
pub use telemetry::{DeliveryEvent, LogSink, MemorySink, NullSink, TelemetrySink};
