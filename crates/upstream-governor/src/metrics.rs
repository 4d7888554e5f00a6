//! Aggregate request metrics and periodic snapshot export.
//!
//! Counters are updated synchronously by the other components. A snapshot
//! of counters plus per-endpoint breaker and rate-limit state is exported to
//! a [`MetricsSink`] on an interval; export failures are logged and dropped.

use crate::domain::{RateLimitStatus, Timestamp};
use crate::ports::MetricsSink;
use crate::resilience::CircuitBreakerState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Governor-wide request counters
#[derive(Default)]
pub struct MetricsCollector {
    // Request counters
    pub total_requests: AtomicU64,
    pub successful_requests: AtomicU64,
    pub failed_requests: AtomicU64,

    // Short-circuit counters
    pub cached_requests: AtomicU64,
    pub deduplicated_requests: AtomicU64,
    pub queued_requests: AtomicU64,

    // Protection counters
    pub circuit_breaks: AtomicU64,
    pub rate_limit_hits: AtomicU64,

    // Latency tracking (executions only, cache hits excluded)
    pub total_latency_ms: AtomicU64,
    pub latency_samples: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an inbound request
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a settled execution
    pub fn record_outcome(&self, success: bool, latency_ms: u64) {
        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request that failed before executing (circuit open, quota)
    pub fn record_rejection(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cached_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deduplicated(&self) {
        self.deduplicated_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queued(&self) {
        self.queued_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_break(&self) {
        self.circuit_breaks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limit_hit(&self) {
        self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Get average latency in ms
    pub fn average_latency_ms(&self) -> f64 {
        let total = self.total_latency_ms.load(Ordering::Relaxed);
        let count = self.latency_samples.load(Ordering::Relaxed);
        if count == 0 {
            0.0
        } else {
            total as f64 / count as f64
        }
    }

    /// Get current counter snapshot
    pub fn snapshot(&self) -> RequestMetrics {
        RequestMetrics {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            cached_requests: self.cached_requests.load(Ordering::Relaxed),
            deduplicated_requests: self.deduplicated_requests.load(Ordering::Relaxed),
            queued_requests: self.queued_requests.load(Ordering::Relaxed),
            average_latency_ms: self.average_latency_ms(),
            circuit_breaks: self.circuit_breaks.load(Ordering::Relaxed),
            rate_limit_hits: self.rate_limit_hits.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter
    pub fn reset(&self) {
        for counter in [
            &self.total_requests,
            &self.successful_requests,
            &self.failed_requests,
            &self.cached_requests,
            &self.deduplicated_requests,
            &self.queued_requests,
            &self.circuit_breaks,
            &self.rate_limit_hits,
            &self.total_latency_ms,
            &self.latency_samples,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time copy of [`MetricsCollector`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub cached_requests: u64,
    pub deduplicated_requests: u64,
    pub queued_requests: u64,
    pub average_latency_ms: f64,
    pub circuit_breaks: u64,
    pub rate_limit_hits: u64,
}

/// Everything exported to a [`MetricsSink`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorSnapshot {
    pub captured_at: Timestamp,
    pub metrics: RequestMetrics,
    pub circuits: Vec<CircuitBreakerState>,
    pub rate_limits: BTreeMap<String, RateLimitStatus>,
    pub cache_size: usize,
    pub queue_depth: usize,
    pub active_requests: usize,
    /// Distinct keys with an execution in progress
    pub in_flight: usize,
}

/// Execution timing helper
pub struct LatencyTimer {
    start: Instant,
    metrics: Arc<MetricsCollector>,
}

impl LatencyTimer {
    pub fn new(metrics: Arc<MetricsCollector>) -> Self {
        Self {
            start: Instant::now(),
            metrics,
        }
    }

    pub fn finish(self, success: bool) {
        let latency_ms = self.start.elapsed().as_millis() as u64;
        self.metrics.record_outcome(success, latency_ms);
    }
}

/// Sink that writes snapshots to the log as JSON
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMetricsSink;

#[async_trait]
impl MetricsSink for LoggingMetricsSink {
    async fn export(&self, snapshot: &GovernorSnapshot) -> anyhow::Result<()> {
        let json = serde_json::to_string(snapshot)?;
        info!(snapshot = %json, "Governor metrics snapshot");
        Ok(())
    }
}

/// Background task exporting snapshots every `interval`.
///
/// `snapshot` returns `None` once the governor is gone, which ends the task.
pub async fn export_task<F>(snapshot: F, sink: Arc<dyn MetricsSink>, interval: Duration)
where
    F: Fn() -> Option<GovernorSnapshot> + Send,
{
    let mut export_interval = tokio::time::interval(interval);
    export_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately
    export_interval.tick().await;

    loop {
        export_interval.tick().await;

        let Some(snapshot) = snapshot() else {
            debug!("Governor dropped, stopping metrics export");
            break;
        };

        if let Err(e) = sink.export(&snapshot).await {
            warn!(error = %e, "Metrics export failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_metrics_recording() {
        let metrics = MetricsCollector::new();

        metrics.record_request();
        metrics.record_request();
        metrics.record_request();
        metrics.record_outcome(true, 100);
        metrics.record_outcome(false, 50);
        metrics.record_cache_hit();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 3);
        assert_eq!(snapshot.successful_requests, 1);
        assert_eq!(snapshot.failed_requests, 1);
        assert_eq!(snapshot.cached_requests, 1);
    }

    #[test]
    fn test_average_latency() {
        let metrics = MetricsCollector::new();
        assert_eq!(metrics.average_latency_ms(), 0.0);

        metrics.record_outcome(true, 100);
        metrics.record_outcome(true, 200);
        metrics.record_outcome(true, 300);

        assert!((metrics.average_latency_ms() - 200.0).abs() < 0.01);
    }

    #[test]
    fn test_rejection_has_no_latency_sample() {
        let metrics = MetricsCollector::new();
        metrics.record_rejection();
        assert_eq!(metrics.failed_requests.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.latency_samples.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_reset() {
        let metrics = MetricsCollector::new();
        metrics.record_request();
        metrics.record_circuit_break();
        metrics.record_rate_limit_hit();
        metrics.record_outcome(true, 10);

        metrics.reset();
        assert_eq!(metrics.snapshot(), RequestMetrics::default());
    }

    #[test]
    fn test_json_export() {
        let metrics = MetricsCollector::new();
        metrics.record_request();

        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["total_requests"], 1);
        assert_eq!(json["circuit_breaks"], 0);
    }

    fn empty_snapshot() -> GovernorSnapshot {
        GovernorSnapshot {
            captured_at: 0,
            metrics: RequestMetrics::default(),
            circuits: Vec::new(),
            rate_limits: BTreeMap::new(),
            cache_size: 0,
            queue_depth: 0,
            active_requests: 0,
            in_flight: 0,
        }
    }

    struct FailingSink {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MetricsSink for FailingSink {
        async fn export(&self, _snapshot: &GovernorSnapshot) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("sink unavailable")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_task_survives_sink_errors() {
        let sink = Arc::new(FailingSink {
            calls: AtomicUsize::new(0),
        });
        let remaining = Arc::new(Mutex::new(3u32));

        let counter = Arc::clone(&remaining);
        let task = tokio::spawn(export_task(
            move || {
                let mut left = counter.lock();
                if *left == 0 {
                    return None;
                }
                *left -= 1;
                Some(empty_snapshot())
            },
            sink.clone(),
            Duration::from_secs(60),
        ));

        task.await.unwrap();
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_logging_sink() {
        tokio_test::assert_ok!(LoggingMetricsSink.export(&empty_snapshot()).await);
    }
}
