#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redelivery::context::MESSAGE_ACTIONS_BINDING_NAME;
use redelivery::{
    BindingMetadata, BoundValue, BrokerClient, BrokerError, ClientResolver, InputBinder,
    InvocationContext, MessageActions, MessageSender, OutgoingMessage, PolicyError,
    ReceivedMessage, TriggerMetadata,
};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestError(pub String);

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TestError {}

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterCall {
    pub message_id: String,
    pub reason: String,
    pub description: String,
}

/// Records dead-letter calls; optionally fails them or never completes them.
#[derive(Debug, Default)]
pub struct RecordingActions {
    pub calls: Mutex<Vec<DeadLetterCall>>,
    pub fail_with: Option<BrokerError>,
    pub hang: bool,
}

impl RecordingActions {
    pub fn failing(error: BrokerError) -> Self {
        Self { fail_with: Some(error), ..Self::default() }
    }

    pub fn hanging() -> Self {
        Self { hang: true, ..Self::default() }
    }

    pub fn calls(&self) -> Vec<DeadLetterCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageActions for RecordingActions {
    async fn dead_letter(
        &self,
        message: &ReceivedMessage,
        reason: &str,
        description: &str,
        _cancel: &CancellationToken,
    ) -> Result<(), BrokerError> {
        if self.hang {
            futures::future::pending::<()>().await;
        }
        if let Some(error) = &self.fail_with {
            return Err(error.clone());
        }
        self.calls.lock().unwrap().push(DeadLetterCall {
            message_id: message.message_id().to_string(),
            reason: reason.to_string(),
            description: description.to_string(),
        });
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ScheduledCall {
    pub destination: String,
    pub message: OutgoingMessage,
    pub enqueue_at: DateTime<Utc>,
}

/// Shared state behind every sender a [`FakeClient`] hands out.
#[derive(Debug, Default)]
pub struct SenderLog {
    pub scheduled: Mutex<Vec<ScheduledCall>>,
    pub closed: Mutex<Vec<String>>,
    pub fail_schedule: Mutex<Option<BrokerError>>,
    /// Never complete scheduling; used to exercise cancellation.
    pub hang: Mutex<bool>,
}

struct RecordingSender {
    destination: String,
    log: Arc<SenderLog>,
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn schedule_message(
        &self,
        message: OutgoingMessage,
        enqueue_at: DateTime<Utc>,
        _cancel: &CancellationToken,
    ) -> Result<i64, BrokerError> {
        let hang = *self.log.hang.lock().unwrap();
        if hang {
            futures::future::pending::<()>().await;
        }
        let failure = self.log.fail_schedule.lock().unwrap().clone();
        if let Some(error) = failure {
            return Err(error);
        }
        let mut scheduled = self.log.scheduled.lock().unwrap();
        scheduled.push(ScheduledCall { destination: self.destination.clone(), message, enqueue_at });
        Ok(1000 + scheduled.len() as i64)
    }

    async fn close(&self, _cancel: &CancellationToken) -> Result<(), BrokerError> {
        self.log.closed.lock().unwrap().push(self.destination.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeClient {
    pub log: Arc<SenderLog>,
}

impl FakeClient {
    pub fn scheduled(&self) -> Vec<ScheduledCall> {
        self.log.scheduled.lock().unwrap().clone()
    }

    pub fn closed(&self) -> Vec<String> {
        self.log.closed.lock().unwrap().clone()
    }
}

impl BrokerClient for FakeClient {
    fn create_sender(&self, destination: &str) -> Result<Box<dyn MessageSender>, BrokerError> {
        Ok(Box::new(RecordingSender { destination: destination.to_string(), log: self.log.clone() }))
    }
}

/// Hands out one [`FakeClient`] and records the connection names it was asked for.
#[derive(Debug, Clone, Default)]
pub struct FakeResolver {
    pub client: FakeClient,
    pub requested: Arc<Mutex<Vec<String>>>,
}

impl ClientResolver for FakeResolver {
    fn create_client(&self, connection_name: &str) -> Result<Arc<dyn BrokerClient>, PolicyError> {
        self.requested.lock().unwrap().push(connection_name.to_string());
        Ok(Arc::new(self.client.clone()))
    }
}

/// Binds a fixed message and message-actions handle.
#[derive(Debug, Default)]
pub struct FakeBinder {
    pub message: Option<ReceivedMessage>,
    pub actions: Option<Arc<RecordingActions>>,
}

#[async_trait]
impl InputBinder for FakeBinder {
    async fn bind(
        &self,
        binding: &BindingMetadata,
        _cancel: &CancellationToken,
    ) -> Result<Option<BoundValue>, BrokerError> {
        if binding.name == MESSAGE_ACTIONS_BINDING_NAME {
            return Ok(self.actions.clone().map(|a| BoundValue::Actions(a as Arc<dyn MessageActions>)));
        }
        Ok(self.message.clone().map(|m| BoundValue::Message(Box::new(m))))
    }
}

/// Context for a queue-triggered function named `orders` on connection `Bus`.
pub fn queue_context(
    message: Option<ReceivedMessage>,
    actions: Option<Arc<RecordingActions>>,
) -> InvocationContext {
    context_with_trigger(TriggerMetadata::queue("orders", "Bus"), message, actions)
}

pub fn context_with_trigger(
    trigger: TriggerMetadata,
    message: Option<ReceivedMessage>,
    actions: Option<Arc<RecordingActions>>,
) -> InvocationContext {
    InvocationContext::builder("orders")
        .input_binding(BindingMetadata::trigger("message"))
        .trigger(trigger)
        .binder(FakeBinder { message, actions })
        .build()
}

/// In-memory log output for asserting what a subscriber printed.
#[derive(Debug, Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Route this thread's tracing output at `level` and above into a [`LogCapture`].
pub fn capture_logs(level: tracing::Level) -> (LogCapture, tracing::subscriber::DefaultGuard) {
    let logs = LogCapture::default();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_ansi(false)
        .with_writer(logs.clone())
        .finish();
    (logs, tracing::subscriber::set_default(subscriber))
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}
