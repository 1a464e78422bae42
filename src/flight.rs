//! Single-flight registry.
//!
//! At most one operation runs per key. Callers arriving while it is in
//! flight await the same result. The operation runs on its own task, so
//! dropping every waiter (client disconnect) does not abort it.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{RelayError, Result};

type SharedResult<V> = Shared<BoxFuture<'static, Result<V>>>;

/// Coalesces concurrent work by key.
pub struct SingleFlight<K, V> {
    in_flight: Arc<Mutex<HashMap<K, SharedResult<V>>>>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `work` for `key`, or join the run already in progress.
    ///
    /// `work` is only invoked when no run for `key` is active.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let shared = {
            let mut in_flight = self.in_flight.lock();
            if let Some(existing) = in_flight.get(&key) {
                debug!(key = ?key, "joining in-flight operation");
                existing.clone()
            } else {
                let registry = Arc::clone(&self.in_flight);
                let task_key = key.clone();
                let fut = work();
                // The lock is held until the entry is inserted, so the task
                // cannot remove its key before it exists.
                let handle = tokio::spawn(async move {
                    let out = fut.await;
                    registry.lock().remove(&task_key);
                    out
                });
                let shared = async move {
                    handle.await.unwrap_or_else(|e| {
                        Err(RelayError::Upstream(format!("in-flight task failed: {e}")))
                    })
                }
                .boxed()
                .shared();
                in_flight.insert(key, shared.clone());
                shared
            }
        };
        shared.await
    }

    /// Number of keys with an operation currently running.
    pub fn len(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
