//! Core request types shared by the governor components.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Milliseconds on the governor's clock (see [`crate::ports::TimeSource`]).
pub type Timestamp = u64;

/// Endpoint used when a request does not name one.
pub const DEFAULT_ENDPOINT: &str = "default";

/// Request urgency.
///
/// Lower discriminants are served first. Within one band requests are
/// served in enqueue order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Executes immediately, bypassing the queue and the concurrency cap
    Critical = 0,
    High = 1,
    #[default]
    Normal = 2,
    Low = 3,
    /// Prefetches and other work nobody is waiting on
    Background = 4,
}

impl Priority {
    /// All priorities, most urgent first
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Background,
    ];

    /// Whether requests at this priority skip the queue entirely
    pub fn bypasses_queue(self) -> bool {
        matches!(self, Priority::Critical)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
            Priority::Background => write!(f, "background"),
        }
    }
}

/// Per-request options recognised by [`crate::RequestGovernor::request`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Queue priority
    pub priority: Priority,
    /// Logical upstream resource used for rate limiting and circuit breaking
    pub endpoint: Option<String>,
    /// Cache TTL for the result (falls back to the configured default)
    pub ttl: Option<Duration>,
    /// Do not consult the cache before executing
    pub skip_cache: bool,
    /// Execute immediately, as if the request were critical
    pub skip_queue: bool,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn skip_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }

    pub fn skip_queue(mut self) -> Self {
        self.skip_queue = true;
        self
    }

    /// Endpoint name, or [`DEFAULT_ENDPOINT`]
    pub fn endpoint(&self) -> &str {
        self.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT)
    }

    /// Whether the request bypasses the queue
    pub fn is_immediate(&self) -> bool {
        self.skip_queue || self.priority.bypasses_queue()
    }
}

/// Sliding-window usage for one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    /// Requests recorded in the current window
    pub current: u32,
    /// Requests allowed per window
    pub max: u32,
    /// Time until the oldest recorded request leaves the window
    pub reset_in_ms: u64,
}
