//! Request governor service - the public entry point.
//!
//! Composes cache, in-flight collapsing, circuit breaking, rate limiting,
//! queuing and retry for every request.

use crate::cache::ResponseCache;
use crate::domain::config::GovernorConfig;
use crate::domain::error::{ExecutorError, GovernorError, GovernorResult};
use crate::domain::{RateLimitStatus, RequestOptions, RetryPolicy};
use crate::inflight::{Attachment, InFlightRegistry, SharedResult};
use crate::metrics::{export_task, GovernorSnapshot, LatencyTimer, MetricsCollector, RequestMetrics};
use crate::ports::{MetricsSink, TimeSource, TokioTimeSource, UserLimiter};
use crate::queue::{executor, Executor, RequestQueue};
use crate::resilience::{CircuitBreakerManager, CircuitBreakerState, RateLimiter};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Outbound request governor.
///
/// Cheap to clone; clones share all state. One instance is meant to be
/// created at startup and handed to every component calling the upstream.
pub struct RequestGovernor<T: Clone + Send + Sync + 'static> {
    inner: Arc<GovernorInner<T>>,
}

impl<T: Clone + Send + Sync + 'static> Clone for RequestGovernor<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct GovernorInner<T: Clone + Send + Sync + 'static> {
    config: GovernorConfig,
    clock: Arc<dyn TimeSource>,
    cache: ResponseCache<T>,
    rate_limiter: Arc<RateLimiter>,
    breakers: CircuitBreakerManager,
    inflight: InFlightRegistry<T>,
    queue: RequestQueue<T>,
    metrics: Arc<MetricsCollector>,
    user_limiter: Option<Arc<dyn UserLimiter>>,
}

impl<T: Clone + Send + Sync + 'static> RequestGovernor<T> {
    /// Create a governor on the tokio clock
    pub fn new(config: GovernorConfig) -> GovernorResult<Self> {
        Self::with_ports(config, Arc::new(TokioTimeSource::new()), None)
    }

    /// Create a governor with an explicit clock and optional per-user quota
    pub fn with_ports(
        config: GovernorConfig,
        clock: Arc<dyn TimeSource>,
        user_limiter: Option<Arc<dyn UserLimiter>>,
    ) -> GovernorResult<Self> {
        config.validate()?;

        let metrics = Arc::new(MetricsCollector::new());
        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit.clone(),
            Arc::clone(&clock),
        ));
        let queue = RequestQueue::new(
            config.queue.clone(),
            RetryPolicy::new(config.retry.clone()),
            Arc::clone(&rate_limiter),
            Arc::clone(&metrics),
            Arc::clone(&clock),
        );

        info!(
            max_concurrent = config.queue.max_concurrent,
            cache_size = config.cache.max_size,
            rate_limit = config.rate_limit.max_requests_per_window,
            failure_threshold = config.circuit_breaker.failure_threshold,
            "Request governor created"
        );

        Ok(Self {
            inner: Arc::new(GovernorInner {
                cache: ResponseCache::new(config.cache.clone(), Arc::clone(&clock)),
                breakers: CircuitBreakerManager::new(
                    config.circuit_breaker.clone(),
                    Arc::clone(&clock),
                ),
                inflight: InFlightRegistry::new(),
                rate_limiter,
                queue,
                metrics,
                user_limiter,
                clock,
                config,
            }),
        })
    }

    /// Run `fetch` for `key` under the governor's protections.
    ///
    /// `fetch` may be called several times (retries) or not at all (cache
    /// hit, in-flight attach, open circuit). Only the final outcome is
    /// returned.
    pub async fn request<F, Fut>(
        &self,
        key: &str,
        fetch: F,
        options: RequestOptions,
    ) -> GovernorResult<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ExecutorError>> + Send + 'static,
    {
        self.request_with(key, executor(fetch), options).await
    }

    /// [`Self::request`] with a prepared [`Executor`]
    pub async fn request_with(
        &self,
        key: &str,
        executor: Executor<T>,
        options: RequestOptions,
    ) -> GovernorResult<T> {
        let inner = &self.inner;
        inner.metrics.record_request();

        if !options.skip_cache {
            if let Some(hit) = inner.cache.get(key, true) {
                if !hit.stale {
                    inner.metrics.record_cache_hit();
                    debug!(key = key, "Cache hit");
                    return Ok(hit.value);
                }
                if inner.config.cache.stale_while_revalidate {
                    inner.metrics.record_cache_hit();
                    self.revalidate(key, executor, &options);
                    return Ok(hit.value);
                }
                // Kept in the cache as a circuit-open fallback
            }
        }

        if let Some(limiter) = &inner.user_limiter {
            if let Err(retry_after) = limiter.check(key, options.endpoint()).await {
                inner.metrics.record_rate_limit_hit();
                inner.metrics.record_rejection();
                debug!(
                    key = key,
                    endpoint = options.endpoint(),
                    retry_after_ms = retry_after.as_millis() as u64,
                    "User quota rejected request"
                );
                return Err(GovernorError::RateLimited {
                    endpoint: options.endpoint().to_string(),
                    retry_after,
                });
            }
        }

        let (result, attachment) = self.start_or_join(key, executor, &options);
        if attachment == Attachment::Joined {
            inner.metrics.record_deduplicated();
        }
        result.await
    }

    /// Refresh a stale entry without making the caller wait
    fn revalidate(&self, key: &str, executor: Executor<T>, options: &RequestOptions) {
        let (_, attachment) = self.start_or_join(key, executor, options);
        debug!(
            key = key,
            already_running = attachment == Attachment::Joined,
            "Serving stale entry, revalidating in background"
        );
    }

    fn start_or_join(
        &self,
        key: &str,
        executor: Executor<T>,
        options: &RequestOptions,
    ) -> (SharedResult<T>, Attachment) {
        let inner = Arc::clone(&self.inner);
        let owned_key = key.to_string();
        let options = options.clone();
        self.inner.inflight.get_or_start(key, move || async move {
            inner.execute(&owned_key, executor, &options).await
        })
    }

    /// Get aggregate counters
    pub fn metrics(&self) -> RequestMetrics {
        self.inner.metrics.snapshot()
    }

    /// Get number of requests waiting in the queue
    pub fn queue_length(&self) -> usize {
        self.inner.queue.len()
    }

    /// Get number of executions currently running
    pub fn active_requests(&self) -> usize {
        self.inner.queue.active()
    }

    pub fn cache_size(&self) -> usize {
        self.inner.cache.len()
    }

    pub fn circuit_breaker_status(&self, endpoint: &str) -> CircuitBreakerState {
        self.inner.breakers.status(endpoint)
    }

    /// Close one endpoint's circuit without touching anything else
    pub fn reset_circuit(&self, endpoint: &str) {
        self.inner.breakers.reset(endpoint);
    }

    /// Breaker state of every endpoint seen so far
    pub fn circuit_stats(&self) -> Vec<CircuitBreakerState> {
        self.inner.breakers.stats()
    }

    pub fn rate_limit_status(&self, endpoint: &str) -> RateLimitStatus {
        self.inner.rate_limiter.status(endpoint)
    }

    /// Drop cached entries: all of them, or those whose key matches `pattern`
    pub fn invalidate(&self, pattern: Option<&str>) -> GovernorResult<usize> {
        self.inner.cache.invalidate(pattern)
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.inner.config
    }

    /// Point-in-time view of counters and per-endpoint state
    pub fn snapshot(&self) -> GovernorSnapshot {
        self.inner.snapshot()
    }

    /// Export a snapshot to `sink` every `metrics.export_interval`.
    ///
    /// The task holds no strong reference: it stops once every governor
    /// handle is dropped, or when the returned handle is aborted.
    pub fn spawn_metrics_export(&self, sink: Arc<dyn MetricsSink>) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.metrics.export_interval;
        info!(
            interval_secs = interval.as_secs(),
            "Starting metrics export task"
        );
        tokio::spawn(export_task(
            move || {
                weak.upgrade().map(|inner| {
                    inner.rate_limiter.prune_idle();
                    inner.snapshot()
                })
            },
            sink,
            interval,
        ))
    }

    /// Clear queue, cache, breakers, rate-limit windows, in-flight entries
    /// and counters.
    ///
    /// Queued callers receive [`GovernorError::Cancelled`]. Executions
    /// already running finish, but their callers still get the result.
    pub fn reset(&self) {
        let inner = &self.inner;
        let cancelled = inner.queue.clear();
        inner.inflight.clear();
        inner.cache.clear();
        inner.breakers.reset_all();
        inner.rate_limiter.reset();
        inner.metrics.reset();
        info!(cancelled = cancelled, "Request governor reset");
    }
}

impl<T: Clone + Send + Sync + 'static> GovernorInner<T> {
    /// Steps after the in-flight check, run once per collapsed group
    async fn execute(
        &self,
        key: &str,
        executor: Executor<T>,
        options: &RequestOptions,
    ) -> GovernorResult<T> {
        let endpoint = options.endpoint();

        if let Err(retry_after) = self.breakers.check(endpoint) {
            if !options.skip_cache {
                if let Some(hit) = self.cache.get(key, true) {
                    self.metrics.record_cache_hit();
                    debug!(
                        key = key,
                        endpoint = endpoint,
                        stale = hit.stale,
                        "Circuit open, serving cached fallback"
                    );
                    return Ok(hit.value);
                }
            }
            self.metrics.record_rejection();
            return Err(GovernorError::CircuitOpen {
                endpoint: endpoint.to_string(),
                retry_after,
            });
        }

        let timer = LatencyTimer::new(Arc::clone(&self.metrics));
        let result = if options.is_immediate() {
            self.queue.execute_immediate(key, endpoint, executor).await
        } else {
            self.queue
                .enqueue(key, options.priority, endpoint, executor)
                .await
        };

        match &result {
            Ok(value) => {
                timer.finish(true);
                self.cache.set(key, value.clone(), options.ttl);
                self.breakers.record_success(endpoint);
            }
            Err(error) if error.is_upstream_failure() => {
                timer.finish(false);
                if self.breakers.record_failure(endpoint) {
                    self.metrics.record_circuit_break();
                }
                debug!(
                    key = key,
                    endpoint = endpoint,
                    status = ?error.executor_error().and_then(ExecutorError::status),
                    error = %error,
                    "Request failed"
                );
            }
            Err(error) if error.executor_error().is_some() => {
                // The upstream answered; a client error says nothing about its health
                timer.finish(false);
                debug!(
                    key = key,
                    endpoint = endpoint,
                    status = ?error.executor_error().and_then(ExecutorError::status),
                    error = %error,
                    "Request rejected by upstream"
                );
            }
            Err(error) => {
                // Never reached the upstream
                self.metrics.record_rejection();
                debug!(key = key, endpoint = endpoint, error = %error, "Request not executed");
            }
        }

        result
    }

    fn snapshot(&self) -> GovernorSnapshot {
        GovernorSnapshot {
            captured_at: self.clock.now(),
            metrics: self.metrics.snapshot(),
            circuits: self.breakers.stats(),
            rate_limits: self.rate_limiter.snapshot(),
            cache_size: self.cache.len(),
            queue_depth: self.queue.len(),
            active_requests: self.queue.active(),
            in_flight: self.inflight.len(),
        }
    }
}
