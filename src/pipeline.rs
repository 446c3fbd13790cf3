//! Invocation lifecycle pipeline.
//!
//! A [`Middleware`] wraps one handler invocation with four hooks, run in strict order:
//!
//! ```text
//! Created -> BeforeHook -> Invoke -> { AfterHook | ExceptionHook } -> AlwaysAfterHook -> Terminal
//! ```
//!
//! - `before` runs first. If it fails, nothing else runs.
//! - `after` runs only when the handler succeeded.
//! - `on_failure` runs when the handler or `after` failed. Returning `true` suppresses the failure
//!   and the invocation completes as [`Outcome::Handled`]; returning `false` hands the handler's
//!   error back untouched as [`InvocationError::Handler`] (an `after` error as
//!   [`InvocationError::Policy`]).
//! - `always_after` runs exactly once after the handler was invoked, on every path.
//!
//! Hook failures surface as [`InvocationError::Policy`]. When the outcome is already an error, a
//! failing `always_after` is logged and the first error wins. Policy errors raised by an inner
//! stage skip the outer stage's `on_failure`; they are never treated as handler failures.
//!
//! A [`Pipeline`] stacks middleware, each attached under a predicate on the invocation context.
//! The first registered middleware is the outermost.
//!
//! Example
//! ```rust
//! use redelivery::pipeline::{InvocationHooks, Middleware, Outcome};
//! use redelivery::InvocationContext;
//!
//! #[derive(Debug)]
//! struct Quiet;
//! impl InvocationHooks for Quiet {}
//!
//! #[derive(Debug)]
//! struct Boom;
//! impl std::fmt::Display for Boom {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "boom") }
//! }
//! impl std::error::Error for Boom {}
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let middleware = Middleware::new(Quiet);
//! let ctx = InvocationContext::builder("orders").build();
//! let ok = middleware.invoke(ctx.clone(), |_| async { Ok::<_, Boom>(7) }).await.unwrap();
//! assert_eq!(ok, Outcome::Completed(7));
//! let err = middleware.invoke(ctx, |_| async { Err::<(), _>(Boom) }).await.unwrap_err();
//! assert!(err.is_handler());
//! # });
//! ```

use crate::client::ClientResolver;
use crate::config::{ExceptionInsightOptions, RetryOptions};
use crate::context::{is_broker_trigger, ContextAdapter, InvocationContext};
use crate::error::{InvocationError, PolicyError};
use crate::policy::DeliveryPolicy;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tower_layer::Layer;
use tower_service::Service;

/// Extension points around a handler invocation. Every hook defaults to a no-op.
#[async_trait]
pub trait InvocationHooks: Send + Sync + fmt::Debug {
    /// Name used in diagnostics.
    fn name(&self) -> &str {
        "Middleware"
    }

    async fn before(&self, _context: &InvocationContext) -> Result<(), PolicyError> {
        Ok(())
    }

    async fn after(&self, _context: &InvocationContext) -> Result<(), PolicyError> {
        Ok(())
    }

    /// Inspect a handler failure. `Ok(true)` marks it handled and suppresses it.
    async fn on_failure(
        &self,
        _context: &InvocationContext,
        _error: &(dyn Error + Send + Sync + 'static),
    ) -> Result<bool, PolicyError> {
        Ok(false)
    }

    async fn always_after(&self, _context: &InvocationContext) -> Result<(), PolicyError> {
        Ok(())
    }
}

/// Lifecycle stage of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    Created,
    BeforeHook,
    Invoke,
    AfterHook,
    ExceptionHook,
    AlwaysAfterHook,
    Terminal,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Created => "Created",
            PipelineStage::BeforeHook => "BeforeHook",
            PipelineStage::Invoke => "Invoke",
            PipelineStage::AfterHook => "AfterHook",
            PipelineStage::ExceptionHook => "ExceptionHook",
            PipelineStage::AlwaysAfterHook => "AlwaysAfterHook",
            PipelineStage::Terminal => "Terminal",
        };
        f.write_str(name)
    }
}

/// How a successful invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The handler returned a value.
    Completed(T),
    /// The handler failed and a hook handled the failure.
    Handled,
}

impl<T> Outcome<T> {
    pub fn is_handled(&self) -> bool {
        matches!(self, Outcome::Handled)
    }

    /// The handler's value, if it completed.
    pub fn into_completed(self) -> Option<T> {
        match self {
            Outcome::Completed(value) => Some(value),
            Outcome::Handled => None,
        }
    }
}

fn enter(middleware: &str, context: &InvocationContext, stage: PipelineStage) {
    tracing::debug!(
        middleware,
        function = context.function_name(),
        invocation_id = context.invocation_id(),
        stage = %stage,
        "pipeline stage"
    );
}

/// A set of hooks applied around handler invocations. Cheap to clone.
#[derive(Clone)]
pub struct Middleware {
    hooks: Arc<dyn InvocationHooks>,
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Middleware").field("hooks", &self.hooks).finish()
    }
}

impl Middleware {
    pub fn new<H>(hooks: H) -> Self
    where
        H: InvocationHooks + 'static,
    {
        Self { hooks: Arc::new(hooks) }
    }

    pub fn from_arc(hooks: Arc<dyn InvocationHooks>) -> Self {
        Self { hooks }
    }

    pub fn name(&self) -> &str {
        self.hooks.name()
    }

    /// Run `handler` inside the hook lifecycle.
    pub async fn invoke<T, E, F, Fut>(
        &self,
        context: InvocationContext,
        handler: F,
    ) -> Result<Outcome<T>, InvocationError<E>>
    where
        F: FnOnce(InvocationContext) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: Error + Send + Sync + 'static,
    {
        self.invoke_nested(context, move |ctx| async move {
            handler(ctx).await.map(Outcome::Completed).map_err(InvocationError::Handler)
        })
        .await
    }

    /// Run `next` inside the hook lifecycle, where `next` is itself a wrapped invocation.
    ///
    /// A handled inner outcome counts as success here, so `after` runs for it.
    pub async fn invoke_nested<T, E, F, Fut>(
        &self,
        context: InvocationContext,
        next: F,
    ) -> Result<Outcome<T>, InvocationError<E>>
    where
        F: FnOnce(InvocationContext) -> Fut + Send,
        Fut: Future<Output = Result<Outcome<T>, InvocationError<E>>> + Send,
        T: Send,
        E: Error + Send + Sync + 'static,
    {
        let hooks = &*self.hooks;
        let name = hooks.name();
        enter(name, &context, PipelineStage::Created);

        enter(name, &context, PipelineStage::BeforeHook);
        hooks.before(&context).await?;

        enter(name, &context, PipelineStage::Invoke);
        tracing::debug!(middleware = name, "Executing middleware");
        let outcome = match next(context.clone()).await {
            Ok(value) => {
                enter(name, &context, PipelineStage::AfterHook);
                match hooks.after(&context).await {
                    Ok(()) => Ok(value),
                    Err(after_error) => {
                        enter(name, &context, PipelineStage::ExceptionHook);
                        match hooks.on_failure(&context, &after_error).await {
                            Ok(true) => Ok(Outcome::Handled),
                            Ok(false) => Err(InvocationError::Policy(after_error)),
                            Err(hook_error) => Err(InvocationError::Policy(hook_error)),
                        }
                    }
                }
            }
            Err(InvocationError::Handler(error)) => {
                enter(name, &context, PipelineStage::ExceptionHook);
                tracing::debug!(
                    middleware = name,
                    error_type = std::any::type_name::<E>(),
                    error = %error,
                    "handler failed"
                );
                match hooks.on_failure(&context, &error).await {
                    Ok(true) => Ok(Outcome::Handled),
                    Ok(false) => Err(InvocationError::Handler(error)),
                    Err(hook_error) => Err(InvocationError::Policy(hook_error)),
                }
            }
            Err(policy) => Err(policy),
        };

        enter(name, &context, PipelineStage::AlwaysAfterHook);
        let cleanup = hooks.always_after(&context).await;
        tracing::debug!(middleware = name, "Executed middleware");
        enter(name, &context, PipelineStage::Terminal);

        match (outcome, cleanup) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(cleanup_error)) => Err(InvocationError::Policy(cleanup_error)),
            (Err(first), Ok(())) => Err(first),
            (Err(first), Err(cleanup_error)) => {
                tracing::warn!(
                    middleware = name,
                    error = %cleanup_error,
                    "always-after hook failed while an earlier error was pending"
                );
                Err(first)
            }
        }
    }
}

type Predicate = Arc<dyn Fn(&InvocationContext) -> bool + Send + Sync>;

#[derive(Clone)]
struct Registration {
    predicate: Predicate,
    middleware: Middleware,
}

/// Ordered middleware, each attached under a predicate.
#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Registration>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages.iter().map(|s| s.middleware.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Middleware whose predicate holds for `context`, outermost first.
    pub fn active_for(&self, context: &InvocationContext) -> Vec<Middleware> {
        self.stages
            .iter()
            .filter(|s| (s.predicate)(context))
            .map(|s| s.middleware.clone())
            .collect()
    }

    /// Run `handler` through every middleware attached for `context`.
    pub async fn run<T, E, F, Fut>(
        &self,
        context: InvocationContext,
        handler: F,
    ) -> Result<Outcome<T>, InvocationError<E>>
    where
        F: FnOnce(InvocationContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Error + Send + Sync + 'static,
    {
        let active = self.active_for(&context);
        tracing::debug!(
            function = context.function_name(),
            middleware_count = active.len(),
            "running pipeline"
        );
        run_chain(active, context, handler).await
    }
}

fn run_chain<T, E, F, Fut>(
    mut stages: Vec<Middleware>,
    context: InvocationContext,
    handler: F,
) -> BoxFuture<'static, Result<Outcome<T>, InvocationError<E>>>
where
    F: FnOnce(InvocationContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Error + Send + Sync + 'static,
{
    if stages.is_empty() {
        return Box::pin(async move {
            handler(context).await.map(Outcome::Completed).map_err(InvocationError::Handler)
        });
    }
    let outer = stages.remove(0);
    Box::pin(async move {
        outer.invoke_nested(context, move |ctx| run_chain(stages, ctx, handler)).await
    })
}

/// Builder for [`Pipeline`].
#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<Registration>,
}

impl PipelineBuilder {
    /// Attach `middleware` for every invocation.
    pub fn use_middleware(self, middleware: Middleware) -> Self {
        self.use_when(|_| true, middleware)
    }

    /// Attach `middleware` for invocations where `predicate` holds.
    pub fn use_when<P>(mut self, predicate: P, middleware: Middleware) -> Self
    where
        P: Fn(&InvocationContext) -> bool + Send + Sync + 'static,
    {
        self.stages.push(Registration { predicate: Arc::new(predicate), middleware });
        self
    }

    /// Dead-letter broker-triggered messages once the broker's delivery count is exhausted.
    pub fn use_exception_insight(
        self,
        options: ExceptionInsightOptions,
        adapter: Arc<dyn ContextAdapter>,
    ) -> Self {
        let policy = DeliveryPolicy::exception_insight(options, adapter);
        self.use_when(is_broker_trigger, Middleware::new(policy))
    }

    /// Reschedule broker-triggered messages with backoff, then dead-letter when exhausted.
    pub fn use_scheduled_retry(
        self,
        options: RetryOptions,
        adapter: Arc<dyn ContextAdapter>,
        resolver: Arc<dyn ClientResolver>,
    ) -> Self {
        let policy = DeliveryPolicy::scheduled_retry(options, adapter, resolver);
        self.use_when(is_broker_trigger, Middleware::new(policy))
    }

    pub fn build(self) -> Pipeline {
        Pipeline { stages: self.stages }
    }
}

/// Tower layer applying a [`Middleware`] around an invocation service.
#[derive(Clone, Debug)]
pub struct MiddlewareLayer {
    middleware: Middleware,
}

impl MiddlewareLayer {
    pub fn new(middleware: Middleware) -> Self {
        Self { middleware }
    }
}

impl<S> Layer<S> for MiddlewareLayer {
    type Service = MiddlewareService<S>;

    fn layer(&self, service: S) -> Self::Service {
        MiddlewareService { inner: service, middleware: self.middleware.clone() }
    }
}

/// Service produced by [`MiddlewareLayer`].
#[derive(Clone, Debug)]
pub struct MiddlewareService<S> {
    inner: S,
    middleware: Middleware,
}

impl<S> Service<InvocationContext> for MiddlewareService<S>
where
    S: Service<InvocationContext> + Clone + Send + 'static,
    S::Response: Send + 'static,
    S::Error: Error + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    type Response = Outcome<S::Response>;
    type Error = InvocationError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(InvocationError::Handler)
    }

    fn call(&mut self, context: InvocationContext) -> Self::Future {
        // the readied service goes into the call; a fresh clone stays behind
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let middleware = self.middleware.clone();
        Box::pin(async move { middleware.invoke(context, move |ctx| inner.call(ctx)).await })
    }
}
