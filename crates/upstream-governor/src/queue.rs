//! Priority-ordered, concurrency-capped dispatch queue with retry.
//!
//! Flow:
//! 1. `enqueue()` files the request under `(priority, sequence)` and hands
//!    the caller a oneshot receiver
//! 2. The drain loop pops the most urgent, oldest request whenever fewer
//!    than `max_concurrent` executions are running
//! 3. The endpoint's rate limit is checked; a refused request goes back to
//!    the front of its band and the whole queue sleeps
//! 4. The request executes on its own task. Retryable failures back off and
//!    re-enter the queue at their original position
//! 5. The final result is sent back through the oneshot channel
//!
//! Critical and skip-queue requests use [`RequestQueue::execute_immediate`]
//! instead: no queue, no concurrency cap, no rate limit, same retry policy.

use crate::domain::config::QueueConfig;
use crate::domain::error::{ExecutorError, GovernorError, GovernorResult};
use crate::domain::{Priority, RetryPolicy, Timestamp};
use crate::metrics::MetricsCollector;
use crate::ports::TimeSource;
use crate::resilience::RateLimiter;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

/// Future returned by an executor
pub type ExecutorFuture<T> = BoxFuture<'static, Result<T, ExecutorError>>;

/// Caller-supplied operation performing the upstream call.
///
/// Called once per attempt, so it must be repeatable.
pub type Executor<T> = Arc<dyn Fn() -> ExecutorFuture<T> + Send + Sync>;

/// Wrap an async closure as an [`Executor`]
pub fn executor<T, F, Fut>(f: F) -> Executor<T>
where
    T: 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<T, ExecutorError>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()) as ExecutorFuture<T>)
}

/// Sort key: priority first, then enqueue order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueuePosition {
    priority: Priority,
    sequence: u64,
}

/// A request waiting for (or between) executions
pub struct QueuedRequest<T> {
    pub id: Uuid,
    pub key: String,
    pub priority: Priority,
    pub endpoint: String,
    pub enqueued_at: Timestamp,
    pub retry_count: u32,
    position: QueuePosition,
    generation: u64,
    executor: Executor<T>,
    responder: oneshot::Sender<GovernorResult<T>>,
}

impl<T> QueuedRequest<T> {
    fn settle(self, result: GovernorResult<T>) {
        if self.responder.send(result).is_err() {
            debug!(id = %self.id, key = %self.key, "Queued request receiver dropped");
        }
    }
}

/// State shared between the queue handle, the drain loop and executions
struct QueueShared<T> {
    pending: Mutex<BTreeMap<QueuePosition, QueuedRequest<T>>>,
    /// Queue-dispatched executions running
    active: AtomicUsize,
    /// Immediate executions running
    immediate: AtomicUsize,
    next_sequence: AtomicU64,
    /// Bumped by `clear()` so retries of cleared requests are dropped
    generation: AtomicU64,
    wake: Notify,
    drain_started: AtomicBool,
    closed: AtomicBool,
    config: QueueConfig,
    retry: RetryPolicy,
    rate_limiter: Arc<RateLimiter>,
    metrics: Arc<MetricsCollector>,
    clock: Arc<dyn TimeSource>,
}

/// Dispatch queue
pub struct RequestQueue<T: Send + 'static> {
    shared: Arc<QueueShared<T>>,
}

impl<T: Send + 'static> RequestQueue<T> {
    pub fn new(
        config: QueueConfig,
        retry: RetryPolicy,
        rate_limiter: Arc<RateLimiter>,
        metrics: Arc<MetricsCollector>,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                pending: Mutex::new(BTreeMap::new()),
                active: AtomicUsize::new(0),
                immediate: AtomicUsize::new(0),
                next_sequence: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                wake: Notify::new(),
                drain_started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                config,
                retry,
                rate_limiter,
                metrics,
                clock,
            }),
        }
    }

    /// Queue a request and wait for its final result.
    ///
    /// Fails fast with [`GovernorError::QueueFull`] when a depth limit is
    /// configured and reached, and with [`GovernorError::Cancelled`] if the
    /// queue is cleared or dropped before the request settles.
    pub async fn enqueue(
        &self,
        key: &str,
        priority: Priority,
        endpoint: &str,
        executor: Executor<T>,
    ) -> GovernorResult<T> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock();
            if let Some(max_depth) = self.shared.config.max_depth {
                if pending.len() >= max_depth {
                    warn!(key = key, depth = pending.len(), "Request queue full");
                    return Err(GovernorError::QueueFull {
                        depth: pending.len(),
                    });
                }
            }

            let position = QueuePosition {
                priority,
                sequence: self.shared.next_sequence.fetch_add(1, Ordering::Relaxed),
            };
            let request = QueuedRequest {
                id: Uuid::new_v4(),
                key: key.to_string(),
                priority,
                endpoint: endpoint.to_string(),
                enqueued_at: self.shared.clock.now(),
                retry_count: 0,
                position,
                generation: self.shared.generation.load(Ordering::SeqCst),
                executor,
                responder: tx,
            };
            debug!(
                id = %request.id,
                key = key,
                priority = %priority,
                endpoint = endpoint,
                "Request queued"
            );
            pending.insert(position, request);
        }

        self.shared.metrics.record_queued();
        self.ensure_drain_loop();
        self.shared.wake.notify_one();

        rx.await.unwrap_or(Err(GovernorError::Cancelled))
    }

    /// Run a request now, bypassing queue, concurrency cap and rate limit
    pub async fn execute_immediate(
        &self,
        key: &str,
        endpoint: &str,
        executor: Executor<T>,
    ) -> GovernorResult<T> {
        let _guard = ActiveGuard::new(&self.shared.immediate);
        debug!(key = key, endpoint = endpoint, "Executing immediately");

        let mut retries = 0;
        loop {
            match attempt(&executor, self.shared.config.request_timeout).await {
                Ok(value) => return Ok(value),
                Err(error) if self.shared.retry.should_retry(&error, retries) => {
                    let delay = self.shared.retry.delay_for(retries);
                    debug!(
                        key = key,
                        endpoint = endpoint,
                        attempt = retries + 1,
                        max_retries = self.shared.retry.max_retries(),
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying immediate request"
                    );
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                Err(error) => return Err(terminal_error(error, retries)),
            }
        }
    }

    /// Get number of queued requests (excluding running and backing-off ones)
    pub fn len(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.pending.lock().is_empty()
    }

    /// Executions currently running, queued and immediate
    pub fn active(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst) + self.shared.immediate.load(Ordering::SeqCst)
    }

    /// Drop every queued request; their callers receive `Cancelled`.
    ///
    /// Requests currently backing off are dropped when they try to re-enter.
    pub fn clear(&self) -> usize {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        let mut pending = self.shared.pending.lock();
        let cleared = pending.len();
        pending.clear();
        if cleared > 0 {
            debug!(cleared = cleared, "Request queue cleared");
        }
        cleared
    }

    fn ensure_drain_loop(&self) {
        if !self.shared.drain_started.swap(true, Ordering::SeqCst) {
            tokio::spawn(drain_loop(Arc::clone(&self.shared)));
        }
    }
}

impl<T: Send + 'static> Drop for RequestQueue<T> {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.pending.lock().clear();
        self.shared.wake.notify_one();
    }
}

impl<T: Send + 'static> QueueShared<T> {
    /// Put a request back at its original position
    fn requeue(&self, request: QueuedRequest<T>) {
        if self.closed.load(Ordering::SeqCst)
            || request.generation != self.generation.load(Ordering::SeqCst)
        {
            debug!(id = %request.id, key = %request.key, "Dropping request from a cleared queue");
            request.settle(Err(GovernorError::Cancelled));
            return;
        }
        self.pending.lock().insert(request.position, request);
        self.wake.notify_one();
    }

    async fn wait_for_wake(&self) {
        let _ = tokio::time::timeout(self.config.poll_interval, self.wake.notified()).await;
    }
}

/// Decrements a counter when dropped
struct ActiveGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> ActiveGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn drain_loop<T: Send + 'static>(shared: Arc<QueueShared<T>>) {
    debug!("Queue drain loop started");

    while !shared.closed.load(Ordering::SeqCst) {
        if shared.active.load(Ordering::SeqCst) >= shared.config.max_concurrent {
            // At capacity: bounded wait, then re-check
            shared.wait_for_wake().await;
            continue;
        }

        let next = shared.pending.lock().pop_first().map(|(_, request)| request);
        let Some(request) = next else {
            shared.wait_for_wake().await;
            continue;
        };

        if let Err(retry_after) = shared.rate_limiter.allow(&request.endpoint) {
            let wait = retry_after.max(shared.rate_limiter.min_retry_after());
            shared.metrics.record_rate_limit_hit();
            warn!(
                endpoint = %request.endpoint,
                retry_after_ms = wait.as_millis() as u64,
                queued = shared.pending.lock().len() + 1,
                "Rate limit reached, throttling queue"
            );
            shared.requeue(request);
            tokio::time::sleep(wait).await;
            continue;
        }

        shared.active.fetch_add(1, Ordering::SeqCst);
        debug!(
            id = %request.id,
            key = %request.key,
            priority = %request.priority,
            retry = request.retry_count,
            waited_ms = shared.clock.now().saturating_sub(request.enqueued_at),
            "Dispatching queued request"
        );
        tokio::spawn(run_queued(Arc::clone(&shared), request));
    }

    debug!("Queue drain loop stopped");
}

async fn run_queued<T: Send + 'static>(shared: Arc<QueueShared<T>>, mut request: QueuedRequest<T>) {
    let outcome = attempt(&request.executor, shared.config.request_timeout).await;

    shared.active.fetch_sub(1, Ordering::SeqCst);
    shared.wake.notify_one();

    match outcome {
        Ok(value) => request.settle(Ok(value)),
        Err(error) if shared.retry.should_retry(&error, request.retry_count) => {
            let delay = shared.retry.delay_for(request.retry_count);
            debug!(
                id = %request.id,
                key = %request.key,
                attempt = request.retry_count + 1,
                max_retries = shared.retry.max_retries(),
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying queued request"
            );
            tokio::time::sleep(delay).await;
            request.retry_count += 1;
            shared.requeue(request);
        }
        Err(error) => {
            let retries = request.retry_count;
            request.settle(Err(terminal_error(error, retries)));
        }
    }
}

/// Run one attempt, applying the per-attempt timeout if configured
async fn attempt<T>(executor: &Executor<T>, timeout: Option<Duration>) -> Result<T, ExecutorError> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, executor())
            .await
            .unwrap_or(Err(ExecutorError::Timeout(limit))),
        None => executor().await,
    }
}

fn terminal_error(error: ExecutorError, retries: u32) -> GovernorError {
    if error.is_retryable() {
        GovernorError::RetriesExhausted {
            attempts: retries + 1,
            last: error,
        }
    } else {
        GovernorError::Executor(error)
    }
}
