mod common;

use common::*;
use redelivery::{
    BrokerError, Capability, DefaultContextAdapter, DeliveryEvent, DeliveryPolicy,
    ExceptionInsightOptions, InvocationError, MemorySink, Middleware, PolicyError,
    ReceivedMessage,
};
use std::sync::Arc;

fn middleware(max: u32) -> (Middleware, MemorySink) {
    let sink = MemorySink::new();
    let policy = DeliveryPolicy::exception_insight(
        ExceptionInsightOptions::new(max).unwrap(),
        Arc::new(DefaultContextAdapter),
    )
    .with_sink(sink.clone());
    (Middleware::new(policy), sink)
}

async fn run_failing(
    middleware: &Middleware,
    message: Option<ReceivedMessage>,
    actions: Option<Arc<RecordingActions>>,
) -> Result<bool, InvocationError<TestError>> {
    middleware
        .invoke(queue_context(message, actions), |_| async {
            Err::<(), _>(TestError("database unavailable".into()))
        })
        .await
        .map(|outcome| outcome.is_handled())
}

#[tokio::test]
async fn exhausted_delivery_count_is_dead_lettered_and_suppressed() {
    init_tracing();
    let (middleware, sink) = middleware(10);
    let actions = Arc::new(RecordingActions::default());
    let message = ReceivedMessage::new("m-1", "b").with_delivery_count(10);

    assert!(run_failing(&middleware, Some(message), Some(actions.clone())).await.unwrap());

    assert_eq!(
        actions.calls(),
        vec![DeadLetterCall {
            message_id: "m-1".into(),
            reason: "Message has been retried 10 times".into(),
            description: "database unavailable".into(),
        }]
    );
    assert_eq!(
        sink.events(),
        vec![DeliveryEvent::DeadLettered {
            message_id: "m-1".into(),
            reason: "Message has been retried 10 times".into(),
        }]
    );
}

#[tokio::test]
async fn dead_lettering_logs_at_debug_only() {
    let (middleware, sink) = middleware(1);
    let actions = Arc::new(RecordingActions::default());

    let (info, guard) = capture_logs(tracing::Level::INFO);
    let message = ReceivedMessage::new("m", "b").with_delivery_count(1);
    assert!(run_failing(&middleware, Some(message), Some(actions.clone())).await.unwrap());
    drop(guard);
    assert_eq!(info.contents(), "");
    assert_eq!(sink.len(), 1);

    let (debug, _guard) = capture_logs(tracing::Level::DEBUG);
    let message = ReceivedMessage::new("m", "b").with_delivery_count(1);
    assert!(run_failing(&middleware, Some(message), Some(actions.clone())).await.unwrap());
    assert!(debug.contents().contains("message dead-lettered"));
    assert_eq!(actions.calls().len(), 2);
}

#[tokio::test]
async fn delivery_count_above_max_is_dead_lettered() {
    let (middleware, _) = middleware(3);
    let actions = Arc::new(RecordingActions::default());
    let message = ReceivedMessage::new("m", "b").with_delivery_count(7);
    assert!(run_failing(&middleware, Some(message), Some(actions.clone())).await.unwrap());
    assert!(actions.calls()[0].reason.contains('7'));
}

#[tokio::test]
async fn below_max_the_original_error_is_returned_unchanged() {
    let (middleware, sink) = middleware(10);
    let actions = Arc::new(RecordingActions::default());
    let message = ReceivedMessage::new("m", "b").with_delivery_count(9);

    let err = run_failing(&middleware, Some(message), Some(actions.clone())).await.unwrap_err();

    assert_eq!(err.into_handler(), Some(TestError("database unavailable".into())));
    assert!(actions.calls().is_empty());
    assert_eq!(sink.events(), vec![DeliveryEvent::Unhandled { message_id: "m".into() }]);
}

#[tokio::test]
async fn missing_message_propagates_the_handler_error() {
    let (middleware, sink) = middleware(1);
    let actions = Arc::new(RecordingActions::default());

    let err = run_failing(&middleware, None, Some(actions.clone())).await.unwrap_err();

    assert!(err.is_handler());
    assert!(actions.calls().is_empty());
    assert_eq!(
        sink.events(),
        vec![DeliveryEvent::MessageMissing { function_name: "orders".into() }]
    );
}

#[tokio::test]
async fn missing_actions_is_fatal_even_below_max() {
    let (middleware, _) = middleware(10);
    let message = ReceivedMessage::new("m", "b").with_delivery_count(1);
    let err = run_failing(&middleware, Some(message), None).await.unwrap_err();
    assert_eq!(
        err.policy_error(),
        Some(&PolicyError::MissingCapability(Capability::MessageActions))
    );
}

#[tokio::test]
async fn dead_letter_failure_surfaces_as_policy_error() {
    let (middleware, sink) = middleware(1);
    let error = BrokerError::DeadLetter { message_id: "m".into(), message: "lock lost".into() };
    let actions = Arc::new(RecordingActions::failing(error.clone()));
    let message = ReceivedMessage::new("m", "b").with_delivery_count(1);

    let err = run_failing(&middleware, Some(message), Some(actions)).await.unwrap_err();

    assert_eq!(err.policy_error(), Some(&PolicyError::Broker(error)));
    assert!(sink.is_empty());
}

#[tokio::test]
async fn success_path_never_touches_the_broker() {
    let (middleware, sink) = middleware(1);
    let actions = Arc::new(RecordingActions::default());
    let ctx = queue_context(Some(ReceivedMessage::new("m", "b").with_delivery_count(5)), Some(actions.clone()));
    let outcome = middleware.invoke(ctx, |_| async { Ok::<_, TestError>("done") }).await.unwrap();
    assert_eq!(outcome.into_completed(), Some("done"));
    assert!(actions.calls().is_empty());
    assert!(sink.is_empty());
}
