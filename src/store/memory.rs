use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::trace;

use super::{CacheStore, CounterStore, StoreError, duration_millis};
use crate::clock::Clock;

#[derive(Debug)]
struct Entry<T> {
    value: T,
    expires_at_ms: u64,
}

impl<T> Entry<T> {
    fn is_live(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms
    }
}

/// In-process counter and cache store.
///
/// Expiry is driven by the injected [`Clock`]: expired entries are ignored on
/// read and reclaimed by [`purge_expired`](Self::purge_expired), which the
/// application calls from a background sweeper task.
///
/// Counters are only atomic within one process. Use [`RedisStore`] when more
/// than one instance serves traffic.
///
/// [`RedisStore`]: super::RedisStore
#[derive(Clone)]
pub struct MemoryStore {
    counters: Arc<Mutex<HashMap<String, Entry<u64>>>>,
    values: Arc<Mutex<HashMap<String, Entry<Vec<u8>>>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: Arc::new(Mutex::new(HashMap::new())),
            values: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    /// Drop every expired counter and cache entry. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();

        let mut counters = self.counters.lock().await;
        let before = counters.len();
        counters.retain(|_, entry| entry.is_live(now));
        let mut removed = before - counters.len();
        drop(counters);

        let mut values = self.values.lock().await;
        let before = values.len();
        values.retain(|_, entry| entry.is_live(now));
        removed += before - values.len();

        trace!(removed, "Purged expired store entries");
        removed
    }

    /// Number of stored counters and cache entries, including expired ones.
    pub async fn len(&self) -> usize {
        self.counters.lock().await.len() + self.values.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let now = self.clock.now_millis();
        let mut counters = self.counters.lock().await;

        let entry = counters
            .entry(key.to_string())
            .and_modify(|entry| {
                if !entry.is_live(now) {
                    entry.value = 0;
                    entry.expires_at_ms = now.saturating_add(duration_millis(ttl));
                }
            })
            .or_insert_with(|| Entry {
                value: 0,
                expires_at_ms: now.saturating_add(duration_millis(ttl)),
            });

        entry.value = entry.value.saturating_add(1);
        Ok(entry.value)
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = self.clock.now_millis();
        let values = self.values.lock().await;
        Ok(values
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        self.values.lock().await.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at_ms: now.saturating_add(duration_millis(ttl)),
            },
        );
        Ok(())
    }
}
