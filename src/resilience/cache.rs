//! Cache-aside reads for idempotent routes.
//!
//! ```text
//! GET key ──hit──► decode ──ok──► return (no primary fetch)
//!    │                │
//!  miss / error    undecodable
//!    ▼                ▼
//! primary fetch ──ok──► SET key value PX ttl ──► return
//!    │
//!   err ──► propagate unchanged, nothing cached
//! ```
//!
//! The cache is an optimisation only. Store errors, timeouts and entries that
//! no longer decode are treated as misses and never reach the caller.
//!
//! With single-flight enabled, concurrent misses for the same key inside one
//! process wait on a per-key lock and re-check the store before fetching, so
//! a cold key costs one primary fetch instead of one per waiting request.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::metrics;
use crate::store::{CacheStore, bounded};

/// Deterministic cache key for a read route.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derive a key from route name, path and query.
    ///
    /// Query pairs are sorted so `?b=2&a=1` and `?a=1&b=2` share an entry.
    pub fn for_request(route: &str, path: &str, query: Option<&str>) -> Self {
        let mut pairs: Vec<&str> = query
            .unwrap_or_default()
            .split('&')
            .filter(|pair| !pair.is_empty())
            .collect();
        pairs.sort_unstable();

        if pairs.is_empty() {
            Self(format!("cache:{route}:{path}"))
        } else {
            Self(format!("cache:{route}:{path}?{}", pairs.join("&")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

type Flight = Arc<tokio::sync::Mutex<()>>;

pub struct CacheAside {
    store: Arc<dyn CacheStore>,
    store_timeout: Duration,
    single_flight: bool,
    flights: Mutex<HashMap<String, Flight>>,
}

impl CacheAside {
    pub fn new(store: Arc<dyn CacheStore>, store_timeout: Duration, single_flight: bool) -> Self {
        Self {
            store,
            store_timeout,
            single_flight,
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached value for `key`, or fetch, store and return it.
    ///
    /// # Errors
    ///
    /// Only `fetch` errors are returned, unchanged. Nothing is cached for them.
    pub async fn read_through<T, E, F, Fut>(&self, key: &CacheKey, ttl: Duration, fetch: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.lookup(key).await {
            return Ok(value);
        }

        if !self.single_flight {
            return self.fill(key, ttl, fetch).await;
        }

        let flight = self.flight(key);
        let guard = flight.lock().await;
        let result = match self.lookup(key).await {
            Some(value) => {
                debug!(key = %key, "Filled by a concurrent request");
                Ok(value)
            }
            None => self.fill(key, ttl, fetch).await,
        };
        drop(guard);
        self.release_flight(key, flight);
        result
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        match bounded(self.store_timeout, self.store.get(key.as_str())).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(value) => {
                    metrics::record_cache_lookup("hit");
                    Some(value)
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Undecodable cache entry; treating as miss");
                    metrics::record_cache_lookup("undecodable");
                    None
                }
            },
            Ok(None) => {
                metrics::record_cache_lookup("miss");
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed; falling back to primary");
                metrics::record_cache_lookup("error");
                metrics::record_store_error("cache", e.as_str(), "miss");
                None
            }
        }
    }

    async fn fill<T, E, F, Fut>(&self, key: &CacheKey, ttl: Duration, fetch: F) -> Result<T, E>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let value = fetch().await?;

        match serde_json::to_vec(&value) {
            Ok(bytes) => {
                if let Err(e) = bounded(self.store_timeout, self.store.set(key.as_str(), &bytes, ttl)).await {
                    warn!(key = %key, error = %e, "Cache write failed");
                    metrics::record_store_error("cache", e.as_str(), "skip_write");
                }
            }
            Err(e) => warn!(key = %key, error = %e, "Value not cacheable"),
        }

        Ok(value)
    }

    fn flight(&self, key: &CacheKey) -> Flight {
        self.flights
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.as_str().to_string())
            .or_default()
            .clone()
    }

    fn release_flight(&self, key: &CacheKey, flight: Flight) {
        let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
        drop(flight);
        // Only the map still holds the lock: nobody is waiting on this key.
        if flights
            .get(key.as_str())
            .is_some_and(|f| Arc::strong_count(f) == 1)
        {
            flights.remove(key.as_str());
        }
    }
}
