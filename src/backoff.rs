//! Backoff calculation for scheduled redelivery.
//!
//! A backoff is a mode plus a base expressed in whole seconds. The delay for a retry attempt is:
//!
//! | mode          | delay                    |
//! |---------------|--------------------------|
//! | `Exponential` | `base ^ attempt` seconds |
//! | `Linear`      | `base * attempt` seconds |
//! | `Constant`    | `base` seconds           |
//!
//! Attempts are 1-based. An attempt of `0` is clamped to `1`, so an untouched message always
//! waits at least one base interval. Results that overflow saturate to [`MAX_BACKOFF`].
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use redelivery::{Backoff, BackoffMode};
//!
//! let backoff = Backoff::new(BackoffMode::Exponential, 10);
//! assert_eq!(backoff.delay(1), Duration::from_secs(10));
//! assert_eq!(backoff.delay(2), Duration::from_secs(100));
//! assert_eq!(Backoff::linear(10).delay(2), Duration::from_secs(20));
//! assert_eq!(Backoff::constant(10).delay(7), Duration::from_secs(10));
//! ```

use crate::error::PolicyError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Largest delay ever produced (`u32::MAX` seconds). Keeps enqueue-time arithmetic in range.
pub const MAX_BACKOFF: Duration = Duration::from_secs(u32::MAX as u64);

/// How the delay grows between scheduled retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BackoffMode {
    /// `base ^ attempt` seconds.
    #[default]
    #[serde(alias = "exponential")]
    Exponential,
    /// `base * attempt` seconds.
    #[serde(alias = "linear")]
    Linear,
    /// `base` seconds regardless of attempt.
    #[serde(alias = "constant")]
    Constant,
}

impl fmt::Display for BackoffMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffMode::Exponential => write!(f, "Exponential"),
            BackoffMode::Linear => write!(f, "Linear"),
            BackoffMode::Constant => write!(f, "Constant"),
        }
    }
}

impl FromStr for BackoffMode {
    type Err = PolicyError;

    /// Parses a mode name case-insensitively. Unknown names are rejected, never defaulted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exponential" => Ok(BackoffMode::Exponential),
            "linear" => Ok(BackoffMode::Linear),
            "constant" => Ok(BackoffMode::Constant),
            _ => Err(PolicyError::UnsupportedBackoffMode(s.to_string())),
        }
    }
}

/// Trait implemented by anything that can turn an attempt number into a delay.
pub trait BackoffStrategy: Send + Sync + fmt::Debug {
    fn delay(&self, attempt: u32) -> Duration;
}

/// Backoff configuration: a mode and a base interval in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    mode: BackoffMode,
    base_seconds: u32,
}

impl Backoff {
    pub fn new(mode: BackoffMode, base_seconds: u32) -> Self {
        Self { mode, base_seconds }
    }

    pub fn exponential(base_seconds: u32) -> Self {
        Self::new(BackoffMode::Exponential, base_seconds)
    }

    pub fn linear(base_seconds: u32) -> Self {
        Self::new(BackoffMode::Linear, base_seconds)
    }

    pub fn constant(base_seconds: u32) -> Self {
        Self::new(BackoffMode::Constant, base_seconds)
    }

    pub fn mode(&self) -> BackoffMode {
        self.mode
    }

    pub fn base_seconds(&self) -> u32 {
        self.base_seconds
    }

    /// Delay before the retry following `attempt` (1-based; `0` is treated as `1`).
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base = u64::from(self.base_seconds);
        let seconds = match self.mode {
            BackoffMode::Exponential => base.checked_pow(attempt),
            BackoffMode::Linear => base.checked_mul(u64::from(attempt)),
            BackoffMode::Constant => Some(base),
        };
        seconds.map(Duration::from_secs).unwrap_or(MAX_BACKOFF).min(MAX_BACKOFF)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(10)
    }
}

impl BackoffStrategy for Backoff {
    fn delay(&self, attempt: u32) -> Duration {
        Backoff::delay(self, attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_raises_base_to_attempt() {
        let backoff = Backoff::exponential(10);
        assert_eq!(backoff.delay(1), Duration::from_secs(10));
        assert_eq!(backoff.delay(2), Duration::from_secs(100));
        assert_eq!(backoff.delay(3), Duration::from_secs(1_000));
    }

    #[test]
    fn linear_multiplies_base_by_attempt() {
        let backoff = Backoff::linear(10);
        assert_eq!(backoff.delay(1), Duration::from_secs(10));
        assert_eq!(backoff.delay(2), Duration::from_secs(20));
        assert_eq!(backoff.delay(9), Duration::from_secs(90));
    }

    #[test]
    fn constant_ignores_attempt() {
        let backoff = Backoff::constant(10);
        for attempt in [1, 2, 5, 100] {
            assert_eq!(backoff.delay(attempt), Duration::from_secs(10));
        }
    }

    #[test]
    fn zero_attempt_is_clamped_to_one() {
        assert_eq!(Backoff::exponential(10).delay(0), Duration::from_secs(10));
        assert_eq!(Backoff::linear(7).delay(0), Duration::from_secs(7));
    }

    #[test]
    fn exponential_overflow_saturates() {
        let backoff = Backoff::exponential(10);
        assert_eq!(backoff.delay(40), MAX_BACKOFF);
        assert_eq!(backoff.delay(u32::MAX), MAX_BACKOFF);
    }

    #[test]
    fn linear_overflow_saturates() {
        let backoff = Backoff::linear(u32::MAX);
        assert_eq!(backoff.delay(u32::MAX), MAX_BACKOFF);
    }

    #[test]
    fn zero_base_behaves() {
        assert_eq!(Backoff::exponential(0).delay(3), Duration::ZERO);
        assert_eq!(Backoff::linear(0).delay(3), Duration::ZERO);
        assert_eq!(Backoff::exponential(1).delay(30), Duration::from_secs(1));
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("Exponential".parse::<BackoffMode>().unwrap(), BackoffMode::Exponential);
        assert_eq!("linear".parse::<BackoffMode>().unwrap(), BackoffMode::Linear);
        assert_eq!(" CONSTANT ".parse::<BackoffMode>().unwrap(), BackoffMode::Constant);
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let err = "Fibonacci".parse::<BackoffMode>().unwrap_err();
        assert!(matches!(err, PolicyError::UnsupportedBackoffMode(ref m) if m == "Fibonacci"));
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn mode_deserializes_from_json() {
        let mode: BackoffMode = serde_json::from_str("\"Linear\"").unwrap();
        assert_eq!(mode, BackoffMode::Linear);
        let mode: BackoffMode = serde_json::from_str("\"constant\"").unwrap();
        assert_eq!(mode, BackoffMode::Constant);
        assert!(serde_json::from_str::<BackoffMode>("\"Random\"").is_err());
    }
}
