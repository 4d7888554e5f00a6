//! In-flight request collapsing.
//!
//! Maps cache keys to the shared result of the execution currently running
//! for them. Concurrent callers with the same key attach to that result
//! instead of starting another execution, so there is at most one
//! execution per key at any time.
//!
//! Executions are spawned onto the runtime: a caller that stops awaiting
//! does not cancel the work, which still completes and populates the cache
//! for anyone else.

use crate::domain::error::{GovernorError, GovernorResult};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Result handle every attached caller can await
pub type SharedResult<T> = Shared<BoxFuture<'static, GovernorResult<T>>>;

/// A running execution
struct InFlightEntry<T> {
    /// Distinguishes this execution from a later one for the same key
    id: u64,
    result: SharedResult<T>,
}

/// How a caller got its result handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    /// This caller started the execution
    Started,
    /// This caller joined an execution already running
    Joined,
}

/// Registry of running executions, keyed by cache key
pub struct InFlightRegistry<T> {
    entries: Arc<Mutex<HashMap<String, InFlightEntry<T>>>>,
    next_id: AtomicU64,
}

impl<T> InFlightRegistry<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Attach to the execution running for `key`, or start one with `start`.
    ///
    /// `start` is only called when no execution is running. The entry is
    /// removed as soon as the execution settles, before attached callers
    /// observe the result.
    pub fn get_or_start<F, Fut>(&self, key: &str, start: F) -> (SharedResult<T>, Attachment)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GovernorResult<T>> + Send + 'static,
    {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(key) {
            debug!(key = key, "Joining in-flight execution");
            return (entry.result.clone(), Attachment::Joined);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let execution = start();
        let registry = Arc::clone(&self.entries);
        let owned_key = key.to_string();

        // Removal needs the lock we hold, so it cannot race the insert below
        let handle = tokio::spawn(async move {
            let result = execution.await;
            let mut entries = registry.lock();
            if entries.get(&owned_key).is_some_and(|entry| entry.id == id) {
                entries.remove(&owned_key);
            }
            result
        });

        let result = async move {
            handle.await.unwrap_or_else(|e| {
                Err(GovernorError::Internal(format!("execution task failed: {}", e)))
            })
        }
        .boxed()
        .shared();

        entries.insert(
            key.to_string(),
            InFlightEntry {
                id,
                result: result.clone(),
            },
        );
        debug!(key = key, "Started in-flight execution");

        (result, Attachment::Started)
    }

    /// Check if an execution is running for `key`
    #[cfg(test)]
    fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Get number of running executions
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Forget every running execution.
    ///
    /// Running executions still complete; new callers start fresh ones.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl<T> Default for InFlightRegistry<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let registry = InFlightRegistry::<u32>::new();
        let executions = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let mut rx = Some(rx);

        let mut handles = Vec::new();
        for _ in 0..5 {
            let executions = Arc::clone(&executions);
            let gate = rx.take();
            let (result, _) = registry.get_or_start("key", move || async move {
                executions.fetch_add(1, Ordering::SeqCst);
                if let Some(gate) = gate {
                    let _ = gate.await;
                }
                Ok(7)
            });
            handles.push(result);
        }

        assert!(registry.contains("key"));
        tx.send(()).unwrap();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 7);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_attachment_kind() {
        let registry = InFlightRegistry::<u32>::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let (first, started) = registry.get_or_start("key", move || async move {
            let _ = rx.await;
            Ok(1)
        });
        let (second, joined) = registry.get_or_start("key", || async { Ok(2) });

        assert_eq!(started, Attachment::Started);
        assert_eq!(joined, Attachment::Joined);

        tx.send(()).unwrap();
        assert_eq!(first.await.unwrap(), 1);
        assert_eq!(second.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_entry_removed_after_failure() {
        let registry = InFlightRegistry::<u32>::new();

        let (result, _) = registry.get_or_start("key", || async { Err(GovernorError::Cancelled) });
        assert!(matches!(result.await, Err(GovernorError::Cancelled)));
        assert!(!registry.contains("key"));

        // A new caller starts a new execution
        let (result, attachment) = registry.get_or_start("key", || async { Ok(3) });
        assert_eq!(attachment, Attachment::Started);
        assert_eq!(result.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_execution_completes_when_caller_stops_waiting() {
        let registry = InFlightRegistry::<u32>::new();
        let done = Arc::new(AtomicUsize::new(0));

        let flag = Arc::clone(&done);
        let (result, _) = registry.get_or_start("key", move || async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            flag.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        });
        drop(result);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_clear_does_not_remove_newer_entry() {
        let registry = InFlightRegistry::<u32>::new();
        let (tx_old, rx_old) = tokio::sync::oneshot::channel::<()>();
        let (tx_new, rx_new) = tokio::sync::oneshot::channel::<()>();

        let (old, _) = registry.get_or_start("key", move || async move {
            let _ = rx_old.await;
            Ok(1)
        });
        registry.clear();
        let (new, attachment) = registry.get_or_start("key", move || async move {
            let _ = rx_new.await;
            Ok(2)
        });
        assert_eq!(attachment, Attachment::Started);

        tx_old.send(()).unwrap();
        assert_eq!(old.await.unwrap(), 1);
        // The old execution settling must not evict the newer one
        assert!(registry.contains("key"));

        tx_new.send(()).unwrap();
        assert_eq!(new.await.unwrap(), 2);
        assert!(!registry.contains("key"));
    }
}
