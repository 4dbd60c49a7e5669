use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{RedisError, Script};
use tracing::{debug, warn};

use super::{CacheStore, CounterStore, StoreError, duration_millis};

/// Increment a counter and start its TTL when the increment created it.
///
/// Runs as one script so concurrent instances never observe a counter
/// without an expiry.
const INCR_WITH_TTL: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
";

/// Redis-backed counter and cache store shared by every instance.
#[derive(Clone)]
pub struct RedisStore {
    connection_manager: ConnectionManager,
    incr_script: Arc<Script>,
}

impl RedisStore {
    /// Connect to Redis and verify the connection with `PING`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when the URL is invalid or the
    /// server cannot be reached.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| {
            warn!(error = %e, "Failed to create Redis client");
            unavailable(e)
        })?;

        let connection_manager = ConnectionManager::new(client).await.map_err(|e| {
            warn!(error = %e, "Failed to create Redis connection manager");
            unavailable(e)
        })?;

        let store = Self {
            connection_manager,
            incr_script: Arc::new(Script::new(INCR_WITH_TTL)),
        };
        store.ping().await?;

        debug!("Connected to Redis store");
        Ok(store)
    }

    /// Round-trip `PING`, used by readiness checks.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection_manager.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

fn unavailable(e: RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let mut conn = self.connection_manager.clone();
        let count: i64 = self
            .incr_script
            .key(key)
            .arg(duration_millis(ttl).max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        u64::try_from(count).map_err(|_| StoreError::Malformed(format!("negative counter {count}")))
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.connection_manager.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async::<Option<Vec<u8>>>(&mut conn)
            .await
            .map_err(unavailable)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection_manager.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(duration_millis(ttl).max(1))
            .query_async::<()>(&mut conn)
            .await
            .map_err(unavailable)
    }
}
