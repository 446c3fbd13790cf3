//! Structured delivery events.
//!
//! Every decision a delivery policy acts on is reported as a [`DeliveryEvent`]. Events flow
//! into a [`TelemetrySink`], which is a `tower::Service<DeliveryEvent>`, so sinks compose with
//! ordinary tower combinators. Emission is best-effort: a sink that is not ready or fails never
//! affects the policy outcome.
//!
//! ```rust
//! use redelivery::telemetry::{DeliveryEvent, MemorySink};
//! use tower::Service;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut sink = MemorySink::new();
//! let event = DeliveryEvent::DeadLettered {
//!     message_id: "m-1".into(),
//!     reason: "Message has been retried 10 times".into(),
//! };
//! sink.call(event.clone()).await.unwrap();
//! assert_eq!(sink.events(), vec![event]);
//! # }
//! ```

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower::Service;

/// What a delivery policy did with a failed invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    /// A clone of the message was scheduled for later delivery.
    Rescheduled {
        message_id: String,
        original_message_id: String,
        /// Attempt number carried by the scheduled clone.
        attempt: u32,
        enqueue_at: DateTime<Utc>,
        sequence_number: i64,
    },
    /// The message was moved to the dead-letter queue.
    DeadLettered { message_id: String, reason: String },
    /// No policy claimed the failure; the handler error propagates to the host.
    Unhandled { message_id: String },
    /// The invocation had no bound message, so nothing could be decided.
    MessageMissing { function_name: String },
}

impl fmt::Display for DeliveryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryEvent::Rescheduled { message_id, attempt, enqueue_at, .. } => {
                write!(f, "Rescheduled({}, attempt={}, at={})", message_id, attempt, enqueue_at)
            }
            DeliveryEvent::DeadLettered { message_id, reason } => {
                write!(f, "DeadLettered({}, reason={})", message_id, reason)
            }
            DeliveryEvent::Unhandled { message_id } => write!(f, "Unhandled({})", message_id),
            DeliveryEvent::MessageMissing { function_name } => {
                write!(f, "MessageMissing({})", function_name)
            }
        }
    }
}

/// A telemetry sink that consumes delivery events.
pub trait TelemetrySink:
    Service<DeliveryEvent, Response = (), Error = Self::SinkError> + Clone + Send + Sync + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: DeliveryEvent)
where
    S: Service<DeliveryEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

type SinkFuture = Pin<Box<dyn Future<Output = Result<(), Infallible>> + Send>>;

/// Discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<DeliveryEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: DeliveryEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Logs events through `tracing` at INFO level.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<DeliveryEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: DeliveryEvent) -> Self::Future {
        tracing::info!(event = %event, "delivery_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Stores events in memory. Oldest events are evicted once `capacity` is reached.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<DeliveryEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Bounded sink with the default capacity of 10,000 events.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Snapshot of the stored events, oldest first.
    pub fn events(&self) -> Vec<DeliveryEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of events dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<DeliveryEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: DeliveryEvent) -> Self::Future {
        let mut guard = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}
