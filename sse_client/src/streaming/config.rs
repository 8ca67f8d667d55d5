use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SseError};

/// Period of the idle sweep, and the smallest accepted non-zero idle timeout
pub const IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Reconnect policy applied per stream key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Reconnect attempts after the first failure; 0 never reconnects
    pub retries: u32,
    /// Fixed delay before every reconnect attempt
    #[serde(rename = "interval_ms", with = "duration_ms")]
    pub interval: Duration,
    /// Clear the attempt counter whenever a connection opens
    ///
    /// With the default `true`, a server that accepts the connection and then
    /// ends the stream right away is reconnected indefinitely: `retries` only
    /// bounds consecutive failures that never reach open. Set it to `false` to
    /// cap the total number of reconnects per subscription.
    pub reset_on_open: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            interval: Duration::from_secs(1),
            reset_on_open: true,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration that gives up on the first error
    pub fn never() -> Self {
        Self {
            retries: 0,
            ..Self::default()
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_reset_on_open(mut self, reset: bool) -> Self {
        self.reset_on_open = reset;
        self
    }
}

/// Configuration for an [`SseClient`](crate::SseClient)
///
/// Every field is optional when deserialized; missing fields keep their
/// defaults. Durations are written as integer milliseconds:
///
/// ```json
/// { "base_url": "http://localhost:8080", "timeout_ms": 30000, "retry": { "retries": 5 } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Prefix prepended to every stream key when connecting
    #[serde(alias = "baseURL")]
    pub base_url: String,
    /// Idle window after which a silent stream is closed; zero disables the check
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout: Duration::from_secs(60),
            retry: RetryConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document, filling in defaults for missing fields
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate().map_err(SseError::InvalidConfiguration)?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set the idle timeout with validation
    pub fn with_timeout(mut self, timeout: Duration) -> std::result::Result<Self, String> {
        check_timeout(timeout)?;
        self.timeout = timeout;
        Ok(self)
    }

    /// Turn the idle check off
    pub fn without_timeout(mut self) -> Self {
        self.timeout = Duration::ZERO;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Whether the idle monitor runs for this configuration
    pub fn idle_check_enabled(&self) -> bool {
        !self.timeout.is_zero()
    }

    /// URL a stream key connects to
    pub fn url_for(&self, key: &str) -> String {
        format!("{}{}", self.base_url, key)
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        check_timeout(self.timeout)
    }
}

fn check_timeout(timeout: Duration) -> std::result::Result<(), String> {
    if !timeout.is_zero() && timeout < IDLE_CHECK_INTERVAL {
        return Err(format!(
            "Idle timeout must be 0 or at least {}ms",
            IDLE_CHECK_INTERVAL.as_millis()
        ));
    }
    Ok(())
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.base_url, "");
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.retry.retries, 3);
        assert_eq!(config.retry.interval, Duration::from_secs(1));
        assert!(config.retry.reset_on_open);
        assert!(config.idle_check_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ClientConfig::from_json_str(
            r#"{ "base_url": "http://localhost:3000", "retry": { "interval_ms": 250 } }"#,
        )
        .unwrap();

        assert_eq!(config.base_url, "http://localhost:3000");
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.retry.retries, 3);
        assert_eq!(config.retry.interval, Duration::from_millis(250));
        assert_eq!(config.url_for("/trigger"), "http://localhost:3000/trigger");
    }

    #[test]
    fn test_json_round_trip_uses_milliseconds() {
        let config = ClientConfig::default()
            .with_timeout(Duration::from_millis(1500))
            .unwrap();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["timeout_ms"], 1500);
        assert_eq!(json["retry"]["interval_ms"], 1000);
    }

    #[test]
    fn test_timeout_validation() {
        assert!(ClientConfig::new().with_timeout(Duration::from_millis(50)).is_err());
        assert!(ClientConfig::new().with_timeout(Duration::ZERO).is_ok());
        assert!(!ClientConfig::new().without_timeout().idle_check_enabled());

        let err = ClientConfig::from_json_str(r#"{ "timeout_ms": 20 }"#).unwrap_err();
        assert!(matches!(err, SseError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_malformed_json_is_a_parse_error() {
        let err = ClientConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, SseError::ConfigParse(_)));
    }

    #[test]
    fn test_never_retry() {
        let retry = RetryConfig::never();
        assert_eq!(retry.retries, 0);
        assert_eq!(RetryConfig::new().with_retries(5).retries, 5);
    }
}
