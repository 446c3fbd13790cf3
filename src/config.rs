//! Configuration: the host's key/value settings and the policy options.
//!
//! [`Settings`] is a flat, read-only key/value view of the host configuration, layered with the
//! `config` crate. Keys use `:` as the section separator (`ConnectionStrings:Bus`); environment
//! variables use `__` instead, and both spellings resolve to the same entry.
//!
//! Options are validated on construction and immutable afterwards; share them behind an `Arc`.
//!
//! ```rust
//! use redelivery::config::{RetryOptions, Settings};
//! use redelivery::BackoffMode;
//!
//! let settings = Settings::new()
//!     .with("ScheduledRetry:MaxDeliveryCount", "5")
//!     .with("ScheduledRetry:BackoffMode", "Linear");
//! let options = RetryOptions::from_settings(&settings, "ScheduledRetry").unwrap();
//! assert_eq!(options.max_delivery_count(), 5);
//! assert_eq!(options.backoff_mode(), BackoffMode::Linear);
//! assert_eq!(options.backoff_in_seconds(), 10);
//! ```

use crate::backoff::{Backoff, BackoffMode};
use crate::error::{BuildError, PolicyError};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

/// Default ceiling for both delivery counters.
pub const DEFAULT_MAX_DELIVERY_COUNT: u32 = 10;
/// Default backoff base in seconds.
pub const DEFAULT_BACKOFF_IN_SECONDS: u32 = 10;

/// Errors produced while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load settings: {0}")]
    Source(#[from] config::ConfigError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("configuration key '{key}' has invalid value '{value}'")]
    InvalidValue { key: String, value: String },
    #[error("invalid settings document: {0}")]
    Json(#[from] serde_json::Error),
}

/// Flat key/value host configuration.
///
/// Keys are case-insensitive and `__` is equivalent to `:`, so `Bus__fullyQualifiedNamespace`
/// and `bus:FullyQualifiedNamespace` name the same entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    values: BTreeMap<String, String>,
}

fn host_environment() -> config::Environment {
    config::Environment::default().separator("__")
}

fn normalize_key(key: &str) -> String {
    key.replace("__", ":").to_lowercase()
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a value.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(normalize_key(&key.into()), value.into());
        self
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        pairs.into_iter().fold(Self::new(), |settings, (k, v)| settings.with(k, v))
    }

    /// Snapshot the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_sources(None, host_environment())
    }

    /// Read a functions host `local.settings.json` document.
    ///
    /// Entries under `Values` become top-level keys; entries under `ConnectionStrings` become
    /// `ConnectionStrings:{name}` and may be plain strings or `{ "ConnectionString": ... }`.
    pub fn from_local_settings_json(json: &str) -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::from_str(json, config::FileFormat::Json))
            .build()?;
        Self::from_config(config)
    }

    /// `local.settings.json` overlaid by the process environment, the order the host applies.
    pub fn load(local_settings: Option<&str>) -> Result<Self, ConfigError> {
        Self::from_sources(local_settings, host_environment())
    }

    fn from_sources(
        local_settings: Option<&str>,
        environment: config::Environment,
    ) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(json) = local_settings {
            builder = builder.add_source(config::File::from_str(json, config::FileFormat::Json));
        }
        let config = builder.add_source(environment).build()?;
        Self::from_config(config)
    }

    fn from_config(config: config::Config) -> Result<Self, ConfigError> {
        let root: HashMap<String, config::Value> = config.try_deserialize()?;
        let mut settings = Self::new();
        for (key, value) in root {
            match key.to_lowercase().as_str() {
                // host document sections
                "values" => settings.flatten(None, value),
                "connectionstrings" => settings.flatten(Some("connectionstrings"), value),
                "isencrypted" | "host" => {}
                _ => settings.flatten(Some(&key), value),
            }
        }
        Ok(settings)
    }

    fn flatten(&mut self, prefix: Option<&str>, value: config::Value) {
        match value.kind {
            config::ValueKind::Table(table) => {
                for (key, child) in table {
                    let path = match prefix {
                        Some(prefix) => format!("{prefix}:{key}"),
                        None => key,
                    };
                    self.flatten(Some(&path), child);
                }
            }
            config::ValueKind::Nil | config::ValueKind::Array(_) => {}
            _ => {
                if let (Some(key), Ok(text)) = (prefix, value.into_string()) {
                    self.values.insert(normalize_key(key), text);
                }
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(&normalize_key(key)).map(String::as_str)
    }

    /// Value for `key` unless it is missing, empty or whitespace.
    pub fn get_non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.trim().is_empty())
    }

    /// `ConnectionStrings:{name}`, or its `ConnectionString` member when given as an object.
    pub fn connection_string(&self, name: &str) -> Option<&str> {
        self.get_non_empty(&format!("ConnectionStrings:{name}"))
            .or_else(|| self.get_non_empty(&format!("ConnectionStrings:{name}:ConnectionString")))
    }

    fn parse_u32(&self, key: &str) -> Result<Option<u32>, ConfigError> {
        match self.get_non_empty(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .map(Some)
                .map_err(|_| ConfigError::InvalidValue { key: key.to_string(), value: raw.to_string() }),
        }
    }
}

/// Options for the delivery-count ceiling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionInsightOptions {
    max_delivery_count: u32,
}

impl ExceptionInsightOptions {
    pub fn new(max_delivery_count: u32) -> Result<Self, BuildError> {
        if max_delivery_count == 0 {
            return Err(BuildError::InvalidMaxDeliveryCount(0));
        }
        Ok(Self { max_delivery_count })
    }

    /// Should not exceed the queue's own max delivery count, which the message does not expose.
    pub fn max_delivery_count(&self) -> u32 {
        self.max_delivery_count
    }

    /// Load `{section}:MaxDeliveryCount`, falling back to the default.
    pub fn from_settings(settings: &Settings, section: &str) -> Result<Self, ConfigError> {
        let max = settings
            .parse_u32(&format!("{section}:MaxDeliveryCount"))?
            .unwrap_or(DEFAULT_MAX_DELIVERY_COUNT);
        Ok(Self::new(max)?)
    }
}

impl Default for ExceptionInsightOptions {
    fn default() -> Self {
        Self { max_delivery_count: DEFAULT_MAX_DELIVERY_COUNT }
    }
}

/// Options for the scheduled retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawRetryOptions")]
pub struct RetryOptions {
    max_delivery_count: u32,
    backoff_mode: BackoffMode,
    backoff_in_seconds: u32,
}

impl RetryOptions {
    pub fn builder() -> RetryOptionsBuilder {
        RetryOptionsBuilder::new()
    }

    pub fn max_delivery_count(&self) -> u32 {
        self.max_delivery_count
    }

    pub fn backoff_mode(&self) -> BackoffMode {
        self.backoff_mode
    }

    pub fn backoff_in_seconds(&self) -> u32 {
        self.backoff_in_seconds
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.backoff_mode, self.backoff_in_seconds)
    }

    /// Load `{section}:MaxDeliveryCount`, `{section}:BackoffMode` and
    /// `{section}:BackoffInSeconds`; missing keys keep their defaults.
    pub fn from_settings(settings: &Settings, section: &str) -> Result<Self, ConfigError> {
        let mut builder = RetryOptions::builder();
        if let Some(max) = settings.parse_u32(&format!("{section}:MaxDeliveryCount"))? {
            builder = builder.max_delivery_count(max);
        }
        if let Some(mode) = settings.get_non_empty(&format!("{section}:BackoffMode")) {
            builder = builder.backoff_mode(mode.parse()?);
        }
        if let Some(seconds) = settings.parse_u32(&format!("{section}:BackoffInSeconds"))? {
            builder = builder.backoff_in_seconds(seconds);
        }
        Ok(builder.build()?)
    }

    /// Parse options from JSON (`{"MaxDeliveryCount": 5, "BackoffMode": "Linear"}`).
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let raw: RawRetryOptions = serde_json::from_str(json)?;
        RetryOptions::try_from(raw)
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_delivery_count: DEFAULT_MAX_DELIVERY_COUNT,
            backoff_mode: BackoffMode::Exponential,
            backoff_in_seconds: DEFAULT_BACKOFF_IN_SECONDS,
        }
    }
}

impl From<RetryOptions> for ExceptionInsightOptions {
    fn from(options: RetryOptions) -> Self {
        Self { max_delivery_count: options.max_delivery_count }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawRetryOptions {
    #[serde(default, alias = "max_delivery_count", alias = "maxDeliveryCount")]
    max_delivery_count: Option<u32>,
    #[serde(default, alias = "backoff_mode", alias = "backoffMode")]
    backoff_mode: Option<String>,
    #[serde(default, alias = "backoff_in_seconds", alias = "backoffInSeconds")]
    backoff_in_seconds: Option<u32>,
}

impl TryFrom<RawRetryOptions> for RetryOptions {
    type Error = ConfigError;

    fn try_from(raw: RawRetryOptions) -> Result<Self, Self::Error> {
        let mut builder = RetryOptions::builder();
        if let Some(max) = raw.max_delivery_count {
            builder = builder.max_delivery_count(max);
        }
        if let Some(mode) = raw.backoff_mode {
            builder = builder.backoff_mode(mode.parse()?);
        }
        if let Some(seconds) = raw.backoff_in_seconds {
            builder = builder.backoff_in_seconds(seconds);
        }
        Ok(builder.build()?)
    }
}

/// Builder for [`RetryOptions`].
#[derive(Debug, Clone)]
pub struct RetryOptionsBuilder {
    max_delivery_count: u32,
    backoff_mode: BackoffMode,
    backoff_in_seconds: u32,
}

impl RetryOptionsBuilder {
    pub fn new() -> Self {
        let defaults = RetryOptions::default();
        Self {
            max_delivery_count: defaults.max_delivery_count,
            backoff_mode: defaults.backoff_mode,
            backoff_in_seconds: defaults.backoff_in_seconds,
        }
    }

    /// Retries are scheduled while the attempt counter is below this value. Must be > 0.
    pub fn max_delivery_count(mut self, max: u32) -> Self {
        self.max_delivery_count = max;
        self
    }

    pub fn backoff_mode(mut self, mode: BackoffMode) -> Self {
        self.backoff_mode = mode;
        self
    }

    /// Base delay for every backoff mode. Must be > 0.
    pub fn backoff_in_seconds(mut self, seconds: u32) -> Self {
        self.backoff_in_seconds = seconds;
        self
    }

    pub fn build(self) -> Result<RetryOptions, BuildError> {
        if self.max_delivery_count == 0 {
            return Err(BuildError::InvalidMaxDeliveryCount(0));
        }
        if self.backoff_in_seconds == 0 {
            return Err(BuildError::InvalidBackoffSeconds(0));
        }
        Ok(RetryOptions {
            max_delivery_count: self.max_delivery_count,
            backoff_mode: self.backoff_mode,
            backoff_in_seconds: self.backoff_in_seconds,
        })
    }
}

impl Default for RetryOptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}
