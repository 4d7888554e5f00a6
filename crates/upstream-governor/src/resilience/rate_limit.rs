//! Sliding-window rate limiting per endpoint.
//!
//! Each endpoint keeps the timestamps of the requests it allowed. On every
//! check, timestamps older than the window are pruned; if the remainder is
//! at the cap the request is refused with the time until the oldest one
//! leaves the window. Bursts up to the cap are allowed and the boundary
//! moves continuously, so there is no synchronized refill tick.

use crate::domain::config::{EndpointLimit, RateLimitConfig};
use crate::domain::{RateLimitStatus, Timestamp};
use crate::ports::TimeSource;
use dashmap::DashMap;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Upper bound on the preallocated timestamp buffer; caps can be huge
const INITIAL_WINDOW_CAPACITY: usize = 64;

/// Sliding window for one endpoint
struct SlidingWindow {
    /// Allowed request times, oldest first
    timestamps: VecDeque<Timestamp>,
    limit: EndpointLimit,
}

impl SlidingWindow {
    fn new(limit: EndpointLimit) -> Self {
        let capacity = (limit.max_requests as usize).min(INITIAL_WINDOW_CAPACITY);
        Self {
            timestamps: VecDeque::with_capacity(capacity),
            limit,
        }
    }

    fn window_ms(&self) -> u64 {
        self.limit.window.as_millis() as u64
    }

    /// Drop timestamps that fell out of `[now - window, now]`
    fn prune(&mut self, now: Timestamp) {
        let window_ms = self.window_ms();
        while let Some(&oldest) = self.timestamps.front() {
            if now.saturating_sub(oldest) > window_ms {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Time until the oldest retained timestamp is pruned
    fn reset_in(&self, now: Timestamp) -> u64 {
        self.timestamps
            .front()
            .map(|&oldest| (oldest + self.window_ms() + 1).saturating_sub(now))
            .unwrap_or(0)
    }

    fn try_acquire(&mut self, now: Timestamp) -> Result<(), Duration> {
        self.prune(now);
        if self.timestamps.len() >= self.limit.max_requests as usize {
            let wait_ms = self.reset_in(now).max(1);
            return Err(Duration::from_millis(wait_ms));
        }
        self.timestamps.push_back(now);
        Ok(())
    }

    fn status(&mut self, now: Timestamp) -> RateLimitStatus {
        self.prune(now);
        RateLimitStatus {
            current: self.timestamps.len() as u32,
            max: self.limit.max_requests,
            reset_in_ms: self.reset_in(now),
        }
    }
}

/// Rate limiter state shared across requests
pub struct RateLimiter {
    /// Per-endpoint windows, created lazily
    windows: DashMap<String, SlidingWindow>,
    config: RateLimitConfig,
    clock: Arc<dyn TimeSource>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn TimeSource>) -> Self {
        Self {
            windows: DashMap::new(),
            config,
            clock,
        }
    }

    /// Check if a request to `endpoint` may be dispatched now.
    ///
    /// On success the request is recorded in the window. On refusal the
    /// error carries how long until a slot frees up.
    pub fn allow(&self, endpoint: &str) -> Result<(), Duration> {
        if !self.config.enabled {
            return Ok(());
        }

        let now = self.clock.now();
        let mut window = self.windows.entry(endpoint.to_string()).or_insert_with(|| {
            debug!(endpoint = endpoint, "Creating new rate limit window");
            SlidingWindow::new(self.config.limit_for(endpoint))
        });

        window.try_acquire(now)
    }

    /// Current usage of `endpoint` without recording a request
    pub fn status(&self, endpoint: &str) -> RateLimitStatus {
        let now = self.clock.now();
        match self.windows.get_mut(endpoint) {
            Some(mut window) => window.status(now),
            None => RateLimitStatus {
                current: 0,
                max: self.config.limit_for(endpoint).max_requests,
                reset_in_ms: 0,
            },
        }
    }

    /// Usage of every tracked endpoint
    pub fn snapshot(&self) -> BTreeMap<String, RateLimitStatus> {
        let now = self.clock.now();
        self.windows
            .iter_mut()
            .map(|mut entry| {
                let status = entry.value_mut().status(now);
                (entry.key().clone(), status)
            })
            .collect()
    }

    /// Minimum time the queue should wait after a refusal
    pub fn min_retry_after(&self) -> Duration {
        self.config.min_retry_after
    }

    /// Drop windows with no requests left in them
    pub fn prune_idle(&self) -> usize {
        let now = self.clock.now();
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            window.prune(now);
            !window.timestamps.is_empty()
        });
        let removed = before - self.windows.len();
        if removed > 0 {
            debug!(removed = removed, "Removed idle rate limit windows");
        }
        removed
    }

    /// Get number of tracked endpoints
    #[cfg(test)]
    fn window_count(&self) -> usize {
        self.windows.len()
    }

    pub fn reset(&self) {
        self.windows.clear();
    }
}
