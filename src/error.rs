//! Error types for the invocation pipeline and delivery policies.
use std::fmt;

/// Collaborator or metadata a policy needed but the invocation did not provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// The broker's message-actions handle (dead-letter, complete, ...).
    MessageActions,
    /// Trigger metadata describing the connection and destination.
    TriggerMetadata,
    /// A connection name on the trigger metadata.
    Connection,
    /// A queue or topic name on the trigger metadata.
    Destination,
    /// A client resolver to reach the broker when rescheduling.
    ClientResolver,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::MessageActions => write!(f, "message actions"),
            Capability::TriggerMetadata => write!(f, "trigger metadata"),
            Capability::Connection => write!(f, "trigger connection"),
            Capability::Destination => write!(f, "trigger destination"),
            Capability::ClientResolver => write!(f, "broker client resolver"),
        }
    }
}

/// Failures reported by broker collaborators (client, sender, message actions, binder).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("failed to create client for connection '{connection}': {message}")]
    Connection { connection: String, message: String },
    #[error("failed to schedule message '{message_id}' on '{destination}': {message}")]
    Schedule { destination: String, message_id: String, message: String },
    #[error("failed to dead-letter message '{message_id}': {message}")]
    DeadLetter { message_id: String, message: String },
    #[error("failed to close sender for '{destination}': {message}")]
    Close { destination: String, message: String },
    #[error("failed to bind input '{binding}': {message}")]
    Binding { binding: String, message: String },
    #[error("broker operation cancelled")]
    Cancelled,
}

/// Retry metadata on a message could not be read as a valid envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("property '{key}' must be {expected}, found {found}")]
    InvalidType { key: &'static str, expected: &'static str, found: &'static str },
    #[error("property '{key}' is out of range: {value}")]
    OutOfRange { key: &'static str, value: i64 },
    #[error("retry envelope version {found} is not supported (max {supported})")]
    UnsupportedVersion { found: i64, supported: u32 },
}

/// Errors raised by a policy or one of its collaborators. These are never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("{0} is not available for this invocation")]
    MissingCapability(Capability),
    #[error("configuration key '{key}' is missing or empty")]
    MissingConfiguration { key: String },
    #[error("backoff mode '{0}' is not supported")]
    UnsupportedBackoffMode(String),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("invocation hook failed: {0}")]
    Hook(String),
}

impl PolicyError {
    /// True when the error came from talking to the broker rather than from configuration.
    pub fn is_broker(&self) -> bool {
        matches!(self, Self::Broker(_))
    }

    /// True when cancellation interrupted a broker call.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Broker(BrokerError::Cancelled))
    }
}

/// Errors produced while building options.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    /// `max_delivery_count` must be > 0.
    #[error("max_delivery_count must be > 0 (got {0})")]
    InvalidMaxDeliveryCount(u32),
    /// `backoff_in_seconds` must be > 0 so a rescheduled message lands in the future.
    #[error("backoff_in_seconds must be > 0 (got {0})")]
    InvalidBackoffSeconds(u32),
}

/// Outcome of a failed invocation.
///
/// `Handler` carries the handler's own error untouched, so callers see exactly what the
/// handler returned whenever no policy claimed the failure.
#[derive(Debug)]
pub enum InvocationError<E> {
    /// The handler failed and no policy handled the failure.
    Handler(E),
    /// A hook or policy failed.
    Policy(PolicyError),
}

impl<E: fmt::Display> fmt::Display for InvocationError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handler(e) => write!(f, "{}", e),
            Self::Policy(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for InvocationError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Handler(e) => Some(e),
            Self::Policy(e) => Some(e),
        }
    }
}

impl<E> From<PolicyError> for InvocationError<E> {
    fn from(err: PolicyError) -> Self {
        Self::Policy(err)
    }
}

impl<E> InvocationError<E> {
    /// Check if this is the handler's own error.
    pub fn is_handler(&self) -> bool {
        matches!(self, Self::Handler(_))
    }

    /// Check if a policy or hook failed.
    pub fn is_policy(&self) -> bool {
        matches!(self, Self::Policy(_))
    }

    /// Get the handler error if this is a `Handler` variant.
    pub fn into_handler(self) -> Option<E> {
        match self {
            Self::Handler(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the handler error if present.
    pub fn as_handler(&self) -> Option<&E> {
        match self {
            Self::Handler(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the policy error if present.
    pub fn policy_error(&self) -> Option<&PolicyError> {
        match self {
            Self::Policy(e) => Some(e),
            _ => None,
        }
    }
}
