//! Upstream Governor - outbound request governance for rate-limited APIs.
//!
//! Sits between an application and an upstream HTTP API that enforces
//! quotas and fails now and then. Protects the upstream from overload,
//! protects callers from upstream failure and removes redundant calls.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                          REQUEST GOVERNOR                                   │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │   request(key, fetch, options)                                              │
//! │         │                                                                   │
//! │  ┌──────┴──────┐  fresh hit / stale + revalidate                            │
//! │  │    Cache    │ ─────────────────────────────────────────────► caller      │
//! │  └──────┬──────┘                                                            │
//! │  ┌──────┴──────┐  attach to the running execution                          │
//! │  │  In-Flight  │ ─────────────────────────────────────────────► caller      │
//! │  └──────┬──────┘                                                            │
//! │  ┌──────┴──────┐  open: cached fallback or CircuitOpen                      │
//! │  │   Circuit   │ ─────────────────────────────────────────────► caller      │
//! │  │   Breaker   │                                                            │
//! │  └──────┬──────┘                                                            │
//! │         ├──────────── critical / skip-queue ──────────┐                     │
//! │  ┌──────┴──────────────────────────────┐              │                     │
//! │  │            Request Queue            │              │                     │
//! │  │  priority order → concurrency cap   │              │                     │
//! │  │  → sliding-window rate limit        │              │                     │
//! │  └──────┬──────────────────────────────┘              │                     │
//! │         └──────────────────┬──────────────────────────┘                     │
//! │                   executor + retry/backoff                                  │
//! │                            │                                                │
//! │            Cache / Circuit Breaker / Metrics updated                        │
//! └────────────────────────────┼────────────────────────────────────────────────┘
//!                              ▼
//!                        Upstream API
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use upstream_governor::{GovernorConfig, Priority, RequestGovernor, RequestOptions};
//!
//! let governor: RequestGovernor<Quote> = RequestGovernor::new(GovernorConfig::default())?;
//! let quote = governor
//!     .request(
//!         "quote:BTC",
//!         move || fetch_quote(client.clone(), "BTC"),
//!         RequestOptions::new()
//!             .with_endpoint("quotes")
//!             .with_priority(Priority::High),
//!     )
//!     .await?;
//! ```
//!
//! # Guarantees
//!
//! - At most one execution per key at any time
//! - No endpoint sees more than its cap within any trailing window
//! - Transient failures (network, timeout, 429, 5xx) are retried inside the
//!   governor; callers only see a single terminal error

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod cache;
pub mod domain;
pub mod inflight;
pub mod metrics;
pub mod ports;
pub mod queue;
pub mod resilience;
pub mod service;
pub mod telemetry;

// Re-exports for public API
pub use cache::{CacheEntry, CacheHit, ResponseCache};
pub use domain::config::{
    CacheConfig, CircuitBreakerConfig, ConfigError, EndpointLimit, GovernorConfig, MetricsConfig,
    QueueConfig, RateLimitConfig, RetryConfig,
};
pub use domain::error::{ExecutorError, GovernorError, GovernorResult};
pub use domain::types::*;
pub use metrics::{GovernorSnapshot, LoggingMetricsSink, MetricsCollector, RequestMetrics};
pub use ports::{ManualTimeSource, MetricsSink, TimeSource, TokioTimeSource, UserLimiter};
pub use queue::{executor, Executor, ExecutorFuture};
pub use resilience::{CircuitBreakerState, CircuitState};
pub use service::RequestGovernor;
pub use telemetry::{init_tracing, TelemetryConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
