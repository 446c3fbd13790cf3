//! Broker collaborators consumed by the delivery policies.
//!
//! The crate does not talk to a broker itself. Hosts plug in implementations of these traits
//! backed by their SDK of choice; tests use in-memory fakes.

use crate::error::BrokerError;
use crate::message::{OutgoingMessage, ReceivedMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Settlement operations the broker exposes for the message being processed.
#[async_trait]
pub trait MessageActions: Send + Sync + fmt::Debug {
    /// Move `message` to the dead-letter queue with a reason and description.
    async fn dead_letter(
        &self,
        message: &ReceivedMessage,
        reason: &str,
        description: &str,
        cancel: &CancellationToken,
    ) -> Result<(), BrokerError>;
}

/// Sender bound to one queue or topic.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Schedule `message` to become visible at `enqueue_at`. Returns the broker's sequence number.
    async fn schedule_message(
        &self,
        message: OutgoingMessage,
        enqueue_at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<i64, BrokerError>;

    /// Release the sender's link.
    async fn close(&self, cancel: &CancellationToken) -> Result<(), BrokerError>;
}

/// Connection to a broker namespace.
pub trait BrokerClient: Send + Sync + fmt::Debug {
    fn create_sender(&self, destination: &str) -> Result<Box<dyn MessageSender>, BrokerError>;
}

impl<T: BrokerClient + ?Sized> BrokerClient for Arc<T> {
    fn create_sender(&self, destination: &str) -> Result<Box<dyn MessageSender>, BrokerError> {
        (**self).create_sender(destination)
    }
}

/// Run a broker call, failing with [`BrokerError::Cancelled`] if `cancel` fires first.
pub async fn run_cancellable<T, Fut>(cancel: &CancellationToken, operation: Fut) -> Result<T, BrokerError>
where
    Fut: Future<Output = Result<T, BrokerError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BrokerError::Cancelled),
        result = operation => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn completes_when_not_cancelled() {
        let cancel = CancellationToken::new();
        let result = run_cancellable(&cancel, async { Ok::<_, BrokerError>(7) }).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn already_cancelled_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = run_cancellable(&cancel, async { Ok::<_, BrokerError>(7) }).await;
        assert_eq!(result, Err(BrokerError::Cancelled));
    }

    #[tokio::test]
    async fn cancellation_interrupts_pending_call() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let result = run_cancellable(&cancel, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, BrokerError>(())
        })
        .await;
        assert_eq!(result, Err(BrokerError::Cancelled));
    }
}
