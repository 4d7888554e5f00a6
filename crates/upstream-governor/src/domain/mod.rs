//! Domain types for the governor.
//!
//! Configuration, error taxonomy, request options and retry policy. Nothing
//! in here performs I/O or spawns tasks.

pub mod config;
pub mod error;
pub mod retry;
pub mod types;

// Re-exports for convenience
pub use config::{
    CacheConfig, CircuitBreakerConfig, ConfigError, EndpointLimit, GovernorConfig, MetricsConfig,
    QueueConfig, RateLimitConfig, RetryConfig,
};
pub use error::{ExecutorError, GovernorError, GovernorResult};
pub use retry::RetryPolicy;
pub use types::{Priority, RateLimitStatus, RequestOptions, Timestamp, DEFAULT_ENDPOINT};
