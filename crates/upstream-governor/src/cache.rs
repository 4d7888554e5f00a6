//! Freshness-aware response cache.
//!
//! Entries carry their own TTL. An entry older than its TTL is flagged
//! stale; stale entries are only handed out when the caller asks for them
//! (stale-while-revalidate, circuit-open fallback) and are dropped otherwise.
//!
//! Capacity is bounded by `max_size`. When full, the entry with the oldest
//! `stored_at` is evicted: insertion-time order, reads do not refresh it.

use crate::domain::config::CacheConfig;
use crate::domain::error::GovernorResult;
use crate::domain::Timestamp;
use crate::ports::TimeSource;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A cached value with its freshness metadata
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub stored_at: Timestamp,
    pub ttl: Duration,
    pub stale: bool,
}

impl<T> CacheEntry<T> {
    fn is_expired(&self, now: Timestamp) -> bool {
        now.saturating_sub(self.stored_at) > self.ttl.as_millis() as u64
    }
}

/// Result of a successful lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHit<T> {
    pub value: T,
    pub stale: bool,
}

/// Key/value cache shared by all governor callers
pub struct ResponseCache<T> {
    entries: Mutex<HashMap<String, CacheEntry<T>>>,
    config: CacheConfig,
    clock: Arc<dyn TimeSource>,
}

impl<T: Clone> ResponseCache<T> {
    pub fn new(config: CacheConfig, clock: Arc<dyn TimeSource>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            config,
            clock,
        }
    }

    /// Look up `key`.
    ///
    /// An expired entry is marked stale. It is returned only when
    /// `allow_stale` is set; otherwise it is removed and the lookup misses.
    pub fn get(&self, key: &str, allow_stale: bool) -> Option<CacheHit<T>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        let entry = entries.get_mut(key)?;
        if entry.is_expired(now) {
            entry.stale = true;
        }

        if !entry.stale {
            return Some(CacheHit {
                value: entry.value.clone(),
                stale: false,
            });
        }

        if allow_stale {
            debug!(key = key, "Serving stale cache entry");
            Some(CacheHit {
                value: entry.value.clone(),
                stale: true,
            })
        } else {
            entries.remove(key);
            debug!(key = key, "Dropped expired cache entry");
            None
        }
    }

    /// Store `value` under `key` with `ttl` (or the configured default)
    pub fn set(&self, key: impl Into<String>, value: T, ttl: Option<Duration>) {
        let key = key.into();
        let entry = CacheEntry {
            value,
            stored_at: self.clock.now(),
            ttl: ttl.unwrap_or(self.config.default_ttl),
            stale: false,
        };

        let mut entries = self.entries.lock();
        if !entries.contains_key(&key) && entries.len() >= self.config.max_size {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.stored_at)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                debug!(evicted = %oldest, "Cache full, evicted oldest entry");
            }
        }
        entries.insert(key, entry);
    }

    /// Remove every entry (`None`) or every key matching a regular expression.
    ///
    /// Returns the number of entries removed.
    pub fn invalidate(&self, pattern: Option<&str>) -> GovernorResult<usize> {
        let mut entries = self.entries.lock();
        let removed = match pattern {
            None => {
                let count = entries.len();
                entries.clear();
                count
            }
            Some(pattern) => {
                let regex = Regex::new(pattern)?;
                let before = entries.len();
                entries.retain(|key, _| !regex.is_match(key));
                before - entries.len()
            }
        };

        debug!(pattern = ?pattern, removed = removed, "Cache invalidated");
        Ok(removed)
    }

    /// Raw entry, including stale ones, without touching freshness flags
    #[cfg(test)]
    fn peek(&self, key: &str) -> Option<CacheEntry<T>> {
        self.entries.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
