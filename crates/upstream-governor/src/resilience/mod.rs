//! Upstream protection: per-endpoint rate limiting and circuit breaking.
//!
//! Both structures are keyed by logical endpoint and created lazily on the
//! first request. Every mutation of one endpoint's state is serialized by
//! its map's lock.

pub mod circuit_breaker;
pub mod rate_limit;

pub use circuit_breaker::{CircuitBreakerManager, CircuitBreakerState, CircuitState};
pub use rate_limit::RateLimiter;
