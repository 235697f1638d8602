//! Cache/pubsub interface.
//!
//! Best-effort by contract: when the backing cache is unavailable, gets
//! return misses, writes are dropped, and the control plane keeps
//! running on the persistence store alone. Nothing here may be used as
//! an authentication result on its own.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Key/value cache with TTLs plus a fire-and-forget publish channel
/// used for cross-replica fan-out.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Returns the value, or a miss when absent, expired, or the cache
    /// is unavailable.
    async fn get(&self, key: &str) -> Option<String>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>);

    async fn delete(&self, key: &str);

    /// Atomic increment with a TTL set on first write. Returns the new
    /// value, or `None` when the cache is unavailable.
    async fn incr(&self, key: &str, ttl: Duration) -> Option<i64>;

    /// Fire-and-forget publish; delivery is not guaranteed.
    async fn publish(&self, channel: &str, payload: &str);
}

struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-process [`CacheStore`] with lazy expiry.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    publish_tx: broadcast::Sender<(String, String)>,
}

impl MemoryCache {
    pub fn new() -> Self {
        let (publish_tx, _) = broadcast::channel(64);
        Self {
            entries: Mutex::new(HashMap::new()),
            publish_tx,
        }
    }

    /// Listen to published messages as `(channel, payload)` pairs.
    pub fn subscribe(&self) -> broadcast::Receiver<(String, String)> {
        self.publish_tx.subscribe()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expired() => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let entry = CacheEntry {
            value: value.to_string(),
            expires_at: ttl.map(|d| Instant::now() + d),
        };
        self.entries.lock().unwrap().insert(key.to_string(), entry);
    }

    async fn delete(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Option<i64> {
        let mut entries = self.entries.lock().unwrap();
        let fresh = match entries.get(key) {
            Some(entry) if !entry.expired() => entry.value.parse::<i64>().unwrap_or(0) + 1,
            _ => 1,
        };
        let expires_at = match entries.get(key) {
            Some(entry) if !entry.expired() => entry.expires_at,
            _ => Some(Instant::now() + ttl),
        };
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: fresh.to_string(),
                expires_at,
            },
        );
        Some(fresh)
    }

    async fn publish(&self, channel: &str, payload: &str) {
        let _ = self
            .publish_tx
            .send((channel.to_string(), payload.to_string()));
    }
}

/// A cache that is permanently unavailable: all gets miss, all writes
/// drop. Useful as the degraded-mode stand-in.
#[derive(Debug, Default)]
pub struct NullCache;

#[async_trait]
impl CacheStore for NullCache {
    async fn get(&self, _key: &str) -> Option<String> {
        None
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) {}

    async fn delete(&self, _key: &str) {}

    async fn incr(&self, _key: &str, _ttl: Duration) -> Option<i64> {
        None
    }

    async fn publish(&self, _channel: &str, _payload: &str) {}
}
