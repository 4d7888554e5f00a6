//! Outbound ports for the governor.
//!
//! These traits define what the governor needs from its surroundings: a
//! clock, somewhere to report metrics, and an optional per-user quota.

use crate::domain::Timestamp;
use crate::metrics::GovernorSnapshot;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Time source for consistent timestamp handling.
///
/// Abstracted to allow testing with deterministic time.
pub trait TimeSource: Send + Sync {
    /// Returns the current timestamp in milliseconds.
    fn now(&self) -> Timestamp;
}

/// Monotonic time source backed by `tokio::time::Instant`.
///
/// Timestamps count from construction. Because it reads tokio's clock it
/// follows `tokio::time::pause()` / `advance()` in tests.
#[derive(Debug, Clone, Copy)]
pub struct TokioTimeSource {
    origin: tokio::time::Instant,
}

impl TokioTimeSource {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for TokioTimeSource {
    fn now(&self) -> Timestamp {
        self.origin.elapsed().as_millis() as Timestamp
    }
}

/// Manually driven time source for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now: AtomicU64,
}

impl ManualTimeSource {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Jump to an absolute time
    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Destination for periodic metrics snapshots.
///
/// Export is fire-and-forget: errors are logged by the export task and never
/// reach request serving.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn export(&self, snapshot: &GovernorSnapshot) -> anyhow::Result<()>;
}

/// Per-user quota enforced outside the governor.
///
/// The governor consults it after a cache miss and before dispatching; it
/// does not know who the user is, only whether the request may proceed.
#[async_trait]
pub trait UserLimiter: Send + Sync {
    /// `Err(retry_after)` rejects the request
    async fn check(&self, key: &str, endpoint: &str) -> Result<(), Duration>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_time_source() {
        let clock = ManualTimeSource::new(1_000);
        assert_eq!(clock.now(), 1_000);

        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now(), 1_250);

        clock.set(5);
        assert_eq!(clock.now(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_time_source_follows_paused_clock() {
        let clock = TokioTimeSource::new();
        assert_eq!(clock.now(), 0);

        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert_eq!(clock.now(), 1_500);
    }
}
