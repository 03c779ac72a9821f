//! Request coalescing (singleflight) for concurrent cache misses.
//!
//! The first caller for a key becomes the leader and runs the load; callers that
//! arrive while it is in flight join and receive a clone of the leader's value.
//! Joiners wait at most `join_timeout`. If the wait times out, or the leader fails
//! or is cancelled, the joiner runs the load itself.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

/// Outcome of a coalesced load.
#[derive(Debug)]
pub enum CoalesceOutcome<V> {
    /// This caller ran the load.
    Executed(V),
    /// This caller received the value loaded by the in-flight leader.
    Joined(V),
}

impl<V> CoalesceOutcome<V> {
    pub fn into_inner(self) -> V {
        match self {
            Self::Executed(v) | Self::Joined(v) => v,
        }
    }

    pub fn was_joined(&self) -> bool {
        matches!(self, Self::Joined(_))
    }
}

/// Snapshot of coalescing counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoalesceMetrics {
    pub leader_count: u64,
    pub joined_count: u64,
    /// Joins that timed out or lost their leader and loaded independently.
    pub fallback_count: u64,
}

pub struct Coalescer<K, V> {
    inflight: Mutex<HashMap<K, watch::Receiver<Option<V>>>>,
    join_timeout: Duration,
    leader_count: AtomicU64,
    joined_count: AtomicU64,
    fallback_count: AtomicU64,
}

/// Removes the leader's in-flight entry however the leader exits.
struct InflightGuard<'a, K: Hash + Eq, V> {
    map: &'a Mutex<HashMap<K, watch::Receiver<Option<V>>>>,
    key: K,
}

impl<K: Hash + Eq, V> Drop for InflightGuard<'_, K, V> {
    fn drop(&mut self) {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

enum Role<V> {
    Leader(watch::Sender<Option<V>>),
    Joiner(watch::Receiver<Option<V>>),
}

impl<K, V> Coalescer<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(join_timeout: Duration) -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
            join_timeout,
            leader_count: AtomicU64::new(0),
            joined_count: AtomicU64::new(0),
            fallback_count: AtomicU64::new(0),
        }
    }

    /// Runs `load` for `key`, or joins the load already in flight for it.
    ///
    /// Only successful values are shared; errors stay with the caller that produced them.
    pub async fn execute_or_join<F, Fut, E>(&self, key: K, load: F) -> Result<CoalesceOutcome<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let role = {
            let mut map = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            match map.get(&key) {
                Some(rx) => Role::Joiner(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    map.insert(key.clone(), rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Joiner(mut rx) => {
                let shared = match tokio::time::timeout(
                    self.join_timeout,
                    rx.wait_for(Option::is_some),
                )
                .await
                {
                    Ok(Ok(value)) => (*value).clone(),
                    _ => None,
                };
                if let Some(value) = shared {
                    self.joined_count.fetch_add(1, Ordering::Relaxed);
                    return Ok(CoalesceOutcome::Joined(value));
                }
                self.fallback_count.fetch_add(1, Ordering::Relaxed);
                load().await.map(CoalesceOutcome::Executed)
            }
            Role::Leader(tx) => {
                let _guard = InflightGuard {
                    map: &self.inflight,
                    key,
                };
                self.leader_count.fetch_add(1, Ordering::Relaxed);
                let result = load().await;
                if let Ok(value) = &result {
                    tx.send_replace(Some(value.clone()));
                }
                result.map(CoalesceOutcome::Executed)
            }
        }
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn metrics(&self) -> CoalesceMetrics {
        CoalesceMetrics {
            leader_count: self.leader_count.load(Ordering::Relaxed),
            joined_count: self.joined_count.load(Ordering::Relaxed),
            fallback_count: self.fallback_count.load(Ordering::Relaxed),
        }
    }
}
