//! Shared state stores used by the rate limiter and cache-aside reader.
//!
//! Two seams:
//!
//! - [`CounterStore`]: atomic "increment and set TTL on creation" counters
//! - [`CacheStore`]: byte values with a per-entry TTL
//!
//! Both are implemented by [`RedisStore`] (shared across instances) and
//! [`MemoryStore`] (single process, development and tests).

mod memory;
mod redis_store;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Failure talking to a shared store.
///
/// Never surfaced to clients directly: the rate limiter applies its failure
/// policy and the cache treats it as a miss.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("store returned malformed data: {0}")]
    Malformed(String),
}

impl StoreError {
    /// Short label used in metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreError::Unavailable(_) => "unavailable",
            StoreError::Timeout(_) => "timeout",
            StoreError::Malformed(_) => "malformed",
        }
    }
}

/// Atomic per-key counters with expiry.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key` and return the post-increment count.
    ///
    /// When the increment creates the key, its TTL is set to `ttl`. Existing
    /// keys keep their original expiry.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;
}

/// Byte-valued cache with per-entry TTL.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch a live entry. Expired entries read as `None`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store `value` under `key`, replacing any previous entry.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError>;
}

/// The store selected at startup, shared by the limiter and the cache.
#[derive(Clone)]
pub enum StoreBackend {
    Redis(RedisStore),
    Memory(MemoryStore),
}

impl StoreBackend {
    pub fn name(&self) -> &'static str {
        match self {
            StoreBackend::Redis(_) => "redis",
            StoreBackend::Memory(_) => "memory",
        }
    }

    /// Check the store answers. The memory store always does.
    pub async fn ping(&self) -> Result<(), StoreError> {
        match self {
            StoreBackend::Redis(store) => store.ping().await,
            StoreBackend::Memory(_) => Ok(()),
        }
    }

    pub fn counters(&self) -> Arc<dyn CounterStore> {
        match self {
            StoreBackend::Redis(store) => Arc::new(store.clone()),
            StoreBackend::Memory(store) => Arc::new(store.clone()),
        }
    }

    pub fn cache(&self) -> Arc<dyn CacheStore> {
        match self {
            StoreBackend::Redis(store) => Arc::new(store.clone()),
            StoreBackend::Memory(store) => Arc::new(store.clone()),
        }
    }
}

/// Run a store operation bounded by `limit`.
pub(crate) async fn bounded<T, F>(limit: Duration, operation: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, operation)
        .await
        .map_err(|_| StoreError::Timeout(limit))?
}

/// Saturating conversion used for TTL arguments.
pub(crate) fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let result: Result<(), StoreError> = bounded(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(StoreError::Timeout(Duration::from_millis(50))));
    }

    #[tokio::test]
    async fn test_memory_backend_shares_entries() {
        let backend = StoreBackend::Memory(MemoryStore::new(Arc::new(crate::clock::SystemClock)));
        assert_eq!(backend.name(), "memory");
        assert!(backend.ping().await.is_ok());

        let ttl = Duration::from_secs(60);
        backend.cache().set("k", b"v", ttl).await.unwrap();
        assert_eq!(backend.cache().get("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(backend.counters().incr_with_ttl("c", ttl).await.unwrap(), 1);
        assert_eq!(backend.counters().incr_with_ttl("c", ttl).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_bounded_passes_through() {
        let result = bounded(Duration::from_secs(1), async { Ok::<_, StoreError>(7) }).await;
        assert_eq!(result, Ok(7));
    }
}
