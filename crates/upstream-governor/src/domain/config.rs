//! Governor configuration with validation.
//!
//! Every section is `#[serde(default)]`, so a partial document only needs to
//! name the values it changes. Durations are written as `"250ms"`, `"30s"`
//! or `"5m"`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Main governor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Response cache configuration
    pub cache: CacheConfig,
    /// Sliding-window rate limiting
    pub rate_limit: RateLimitConfig,
    /// Per-endpoint circuit breaking
    pub circuit_breaker: CircuitBreakerConfig,
    /// Dispatch queue configuration
    pub queue: QueueConfig,
    /// Retry and backoff configuration
    pub retry: RetryConfig,
    /// Metrics export configuration
    pub metrics: MetricsConfig,
}

impl GovernorConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.max_size == 0 {
            return Err(ConfigError::InvalidCache("max_size cannot be 0".into()));
        }

        self.rate_limit.validate()?;

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::InvalidCircuitBreaker(
                "failure_threshold cannot be 0".into(),
            ));
        }
        if self.circuit_breaker.success_threshold == 0 {
            return Err(ConfigError::InvalidCircuitBreaker(
                "success_threshold cannot be 0".into(),
            ));
        }

        if self.queue.max_concurrent == 0 {
            return Err(ConfigError::InvalidQueue("max_concurrent cannot be 0".into()));
        }
        if self.queue.poll_interval.is_zero() {
            return Err(ConfigError::InvalidQueue("poll_interval cannot be 0".into()));
        }
        if self.queue.max_depth == Some(0) {
            return Err(ConfigError::InvalidQueue("max_depth cannot be 0".into()));
        }

        if self.retry.backoff_base < 1.0 {
            return Err(ConfigError::InvalidRetry(format!(
                "backoff_base must be >= 1.0, got {}",
                self.retry.backoff_base
            )));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(ConfigError::InvalidRetry(
                "initial_delay cannot exceed max_delay".into(),
            ));
        }

        if self.metrics.export_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "metrics export_interval cannot be 0".into(),
            ));
        }

        Ok(())
    }
}

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries before the oldest is evicted
    pub max_size: usize,
    /// TTL used when a request does not specify one
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
    /// Serve expired entries while refreshing them in the background
    pub stale_while_revalidate: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_ttl: Duration::from_secs(5 * 60),
            stale_while_revalidate: true,
        }
    }
}

/// Sliding-window rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    /// Requests allowed per window for endpoints without an override
    pub max_requests_per_window: u32,
    /// Sliding window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Minimum time the queue waits after being throttled
    #[serde(with = "humantime_serde")]
    pub min_retry_after: Duration,
    /// Per-endpoint overrides
    pub endpoints: HashMap<String, EndpointLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests_per_window: 100,
            window: Duration::from_secs(60),
            min_retry_after: Duration::from_secs(1),
            endpoints: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    /// Limit that applies to `endpoint`
    pub fn limit_for(&self, endpoint: &str) -> EndpointLimit {
        self.endpoints
            .get(endpoint)
            .copied()
            .unwrap_or(EndpointLimit {
                max_requests: self.max_requests_per_window,
                window: self.window,
            })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_requests_per_window == 0 {
            return Err(ConfigError::InvalidRateLimit(
                "max_requests_per_window cannot be 0".into(),
            ));
        }
        if self.window.is_zero() {
            return Err(ConfigError::InvalidRateLimit("window cannot be 0".into()));
        }
        for (endpoint, limit) in &self.endpoints {
            if limit.max_requests == 0 || limit.window.is_zero() {
                return Err(ConfigError::InvalidRateLimit(format!(
                    "override for '{}' must have non-zero max_requests and window",
                    endpoint
                )));
            }
        }
        Ok(())
    }
}

/// Rate limit for a single endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointLimit {
    pub max_requests: u32,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

/// Circuit breaker configuration for upstream resilience
///
/// When an endpoint fails repeatedly, the circuit opens and requests are
/// rejected immediately (or served from cache) until the endpoint recovers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Enable circuit breaker
    pub enabled: bool,
    /// Number of failures before opening the circuit
    pub failure_threshold: u32,
    /// Number of successes in half-open state before closing
    pub success_threshold: u32,
    /// Duration before half-open from open state
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// Dispatch queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum queue-dispatched executions in flight
    pub max_concurrent: usize,
    /// How long the drain loop waits before re-checking capacity
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Reject new requests once this many are queued (unbounded when unset)
    pub max_depth: Option<usize>,
    /// Fail an executor attempt that runs longer than this
    #[serde(with = "humantime_serde::option")]
    pub request_timeout: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 6,
            poll_interval: Duration::from_millis(100),
            max_depth: None,
            request_timeout: None,
        }
    }
}

/// Retry and exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry (before jitter)
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Exponential growth factor
    pub backoff_base: f64,
    /// Ceiling for any computed delay, jitter included
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Upper bound of the uniform random addition
    #[serde(with = "humantime_serde")]
    pub jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            backoff_base: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_secs(1),
        }
    }
}

/// Metrics export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Interval between snapshot exports to the metrics sink
    #[serde(with = "humantime_serde")]
    pub export_interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            export_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid cache config: {0}")]
    InvalidCache(String),
    #[error("invalid rate limit: {0}")]
    InvalidRateLimit(String),
    #[error("invalid circuit breaker config: {0}")]
    InvalidCircuitBreaker(String),
    #[error("invalid queue config: {0}")]
    InvalidQueue(String),
    #[error("invalid retry config: {0}")]
    InvalidRetry(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Humantime serde module for Duration serialization
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_some(&super::format_duration(d)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| super::parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }

    fn format_duration(duration: &Duration) -> String {
        if duration.subsec_millis() == 0 {
            format!("{}s", duration.as_secs())
        } else {
            format!("{}ms", duration.as_millis())
        }
    }

    pub(super) fn parse_duration(s: &str) -> Result<Duration, &'static str> {
        let s = s.trim();
        // "ms" must be checked before the single-letter suffixes
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| "invalid milliseconds")
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| "invalid seconds")
        } else if let Some(mins) = s.strip_suffix('m') {
            let mins = mins.trim().parse::<u64>().map_err(|_| "invalid minutes")?;
            mins.checked_mul(60)
                .map(Duration::from_secs)
                .ok_or("duration too large")
        } else {
            // Try parsing as plain seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| "invalid duration format")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GovernorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.max_size, 1000);
        assert_eq!(config.queue.max_concurrent, 6);
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn test_rate_limit_validation() {
        let mut config = GovernorConfig::default();
        config.rate_limit.max_requests_per_window = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRateLimit(_))
        ));
    }

    #[test]
    fn test_override_validation() {
        let mut config = GovernorConfig::default();
        config.rate_limit.endpoints.insert(
            "prices".into(),
            EndpointLimit {
                max_requests: 0,
                window: Duration::from_secs(1),
            },
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRateLimit(_))
        ));
    }

    #[test]
    fn test_retry_validation() {
        let mut config = GovernorConfig::default();
        config.retry.backoff_base = 0.5;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidRetry(_))));

        let mut config = GovernorConfig::default();
        config.retry.initial_delay = Duration::from_secs(60);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidRetry(_))));
    }

    #[test]
    fn test_queue_validation() {
        let mut config = GovernorConfig::default();
        config.queue.max_concurrent = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidQueue(_))));
    }

    #[test]
    fn test_limit_for_uses_override() {
        let mut config = RateLimitConfig::default();
        config.endpoints.insert(
            "prices".into(),
            EndpointLimit {
                max_requests: 5,
                window: Duration::from_secs(10),
            },
        );
        assert_eq!(config.limit_for("prices").max_requests, 5);
        assert_eq!(config.limit_for("other").max_requests, 100);
        assert_eq!(config.limit_for("other").window, Duration::from_secs(60));
    }

    #[test]
    fn test_partial_json_document() {
        let json = r#"{
            "cache": { "default_ttl": "30s" },
            "rate_limit": {
                "window": "1000ms",
                "endpoints": { "prices": { "max_requests": 10, "window": "1m" } }
            },
            "queue": { "request_timeout": "5s" }
        }"#;
        let config: GovernorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.cache.default_ttl, Duration::from_secs(30));
        assert_eq!(config.cache.max_size, 1000);
        assert_eq!(config.rate_limit.window, Duration::from_secs(1));
        assert_eq!(
            config.rate_limit.limit_for("prices").window,
            Duration::from_secs(60)
        );
        assert_eq!(config.queue.request_timeout, Some(Duration::from_secs(5)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_oversized_duration_rejected() {
        let json = r#"{ "rate_limit": { "window": "999999999999999999m" } }"#;
        let err = serde_json::from_str::<GovernorConfig>(json).unwrap_err();
        assert!(err.to_string().contains("duration too large"));
    }

    #[test]
    fn test_parse_duration_suffixes() {
        use humantime_serde::parse_duration;
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("3s"), Ok(Duration::from_secs(3)));
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration("7"), Ok(Duration::from_secs(7)));
        assert!(parse_duration("soon").is_err());
        assert_eq!(
            parse_duration("999999999999999999m"),
            Err("duration too large")
        );
    }
}
