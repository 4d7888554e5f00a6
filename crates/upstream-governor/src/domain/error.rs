//! Governor error taxonomy.
//!
//! Callers only ever see a single terminal [`GovernorError`]. Transient
//! executor failures are retried inside the governor and surface only as
//! [`GovernorError::RetriesExhausted`].

use crate::domain::config::ConfigError;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by a caller-supplied executor
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    /// Connection refused, reset, DNS failure, ...
    #[error("network error: {0}")]
    Network(String),

    /// The attempt exceeded the configured request timeout
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The upstream answered with a non-success status
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Anything else (decoding, validation, ...); never retried
    #[error("{0}")]
    Other(String),
}

impl ExecutorError {
    pub fn network(details: impl Into<String>) -> Self {
        Self::Network(details.into())
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    pub fn other(details: impl Into<String>) -> Self {
        Self::Other(details.into())
    }

    /// HTTP status, if the upstream produced one
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The upstream rejected the request itself (4xx other than 429)
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Http { status, .. } if *status != 429 && (400..500).contains(status))
    }

    /// Network failures, timeouts, 429 and 5xx are worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) => true,
            Self::Http { status, .. } => *status == 429 || (500..600).contains(status),
            Self::Other(_) => false,
        }
    }
}

/// Terminal error returned to governor callers
#[derive(Debug, Clone, Error)]
pub enum GovernorError {
    /// The endpoint's circuit is open and no cached fallback exists
    #[error("circuit open for endpoint '{endpoint}' (retry in {retry_after:?})")]
    CircuitOpen {
        endpoint: String,
        retry_after: Duration,
    },

    /// A user-scoped quota rejected the request
    #[error("rate limited on endpoint '{endpoint}' (retry in {retry_after:?})")]
    RateLimited {
        endpoint: String,
        retry_after: Duration,
    },

    /// The executor failed with a non-retryable error
    #[error("executor failed: {0}")]
    Executor(ExecutorError),

    /// Every attempt failed with a retryable error
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: ExecutorError },

    /// The queue is at its configured depth limit
    #[error("request queue full ({depth} queued)")]
    QueueFull { depth: usize },

    /// The request was dropped before it could execute
    #[error("request cancelled")]
    Cancelled,

    /// Cache invalidation pattern did not compile
    #[error("invalid invalidation pattern: {0}")]
    InvalidPattern(String),

    /// Configuration rejected at construction
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl GovernorError {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }

    /// Whether this outcome reflects upstream health and should feed the
    /// circuit breaker. Client errors mean the upstream answered, so they
    /// are excluded.
    pub fn is_upstream_failure(&self) -> bool {
        match self {
            Self::Executor(e) => !e.is_client_error(),
            Self::RetriesExhausted { .. } => true,
            _ => false,
        }
    }

    /// Underlying executor error, if any
    pub fn executor_error(&self) -> Option<&ExecutorError> {
        match self {
            Self::Executor(e) | Self::RetriesExhausted { last: e, .. } => Some(e),
            _ => None,
        }
    }
}

impl From<regex::Error> for GovernorError {
    fn from(e: regex::Error) -> Self {
        GovernorError::InvalidPattern(e.to_string())
    }
}

/// Result type for governor operations
pub type GovernorResult<T> = Result<T, GovernorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ExecutorError::network("connection reset").is_retryable());
        assert!(ExecutorError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(ExecutorError::http(429, "slow down").is_retryable());
        assert!(ExecutorError::http(500, "oops").is_retryable());
        assert!(ExecutorError::http(503, "unavailable").is_retryable());
        assert!(ExecutorError::http(504, "gateway timeout").is_retryable());

        assert!(!ExecutorError::http(400, "bad request").is_retryable());
        assert!(!ExecutorError::http(404, "not found").is_retryable());
        assert!(!ExecutorError::other("decode failed").is_retryable());
    }

    #[test]
    fn test_client_error_classification() {
        assert!(ExecutorError::http(400, "bad request").is_client_error());
        assert!(ExecutorError::http(404, "not found").is_client_error());
        assert!(!ExecutorError::http(429, "slow down").is_client_error());
        assert!(!ExecutorError::http(500, "oops").is_client_error());
        assert!(!ExecutorError::network("x").is_client_error());
    }

    #[test]
    fn test_status() {
        assert_eq!(ExecutorError::http(503, "x").status(), Some(503));
        assert_eq!(ExecutorError::network("x").status(), None);
    }

    #[test]
    fn test_upstream_failure() {
        assert!(GovernorError::Executor(ExecutorError::other("decode")).is_upstream_failure());
        assert!(!GovernorError::Executor(ExecutorError::http(404, "x")).is_upstream_failure());
        assert!(GovernorError::RetriesExhausted {
            attempts: 4,
            last: ExecutorError::network("x"),
        }
        .is_upstream_failure());
        assert!(!GovernorError::Cancelled.is_upstream_failure());
        assert!(!GovernorError::CircuitOpen {
            endpoint: "e".into(),
            retry_after: Duration::ZERO,
        }
        .is_upstream_failure());
    }

    #[test]
    fn test_from_regex_error() {
        let err: GovernorError = regex::Regex::new("(unclosed").unwrap_err().into();
        assert!(matches!(err, GovernorError::InvalidPattern(_)));
    }

    #[test]
    fn test_display() {
        let err = GovernorError::RetriesExhausted {
            attempts: 4,
            last: ExecutorError::http(503, "unavailable"),
        };
        let message = err.to_string();
        assert!(message.contains("4 attempts"));
        assert!(message.contains("503"));
    }
}
