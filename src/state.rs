//! Shared application state for Axum handlers.
//!
//! This module provides thread-safe, clonable state that is shared across
//! all request handlers. It includes:
//!
//! - **Pipeline**: Credential verifier, rate limiter, breakers and cache
//! - **Route policies**: The validated stage list of every protected route
//! - **Dependencies**: Report store and notification service
//! - **Store backend**: Redis or in-memory, for readiness and sweeping
//!
//! # Structured Concurrency
//!
//! Background tasks are managed using `tokio_util::task::TaskTracker` and
//! `CancellationToken` for proper lifecycle management. Call `shutdown()`
//! to gracefully stop all background tasks before application exit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::FromRef;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::auth::CredentialVerifier;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::middleware::TrustedProxies;
use crate::pipeline::Pipeline;
use crate::resilience::{BreakerRegistry, CacheAside, RateLimiter};
use crate::routes::{NOTIFIER_DEPENDENCY, RoutePolicies};
use crate::services::{
    LogNotifier, NotificationService, Notifier, ReportStore, WebhookNotifier,
};
use crate::store::{MemoryStore, RedisStore, StoreBackend};

/// Shared application state for Axum handlers.
///
/// Cloned for each request; all internal data is behind `Arc`.
///
/// # Lifecycle
///
/// The store sweeper is spawned when the state is created. Call `shutdown()`
/// before dropping to ensure clean task termination.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    pub policies: Arc<RoutePolicies>,
    pub reports: ReportStore,
    pub notifications: NotificationService,
    pub store: StoreBackend,
    pub trusted_proxies: Arc<TrustedProxies>,
    /// Timestamp when the application started
    pub started_at: Instant,
    /// Application configuration
    pub config: Arc<Config>,
    /// Tracks spawned background tasks for graceful shutdown
    task_tracker: TaskTracker,
    /// Cancellation token for signaling background tasks to stop
    cancellation_token: CancellationToken,
}

impl FromRef<AppState> for Arc<TrustedProxies> {
    fn from_ref(state: &AppState) -> Self {
        state.trusted_proxies.clone()
    }
}

impl AppState {
    /// Build state from configuration: connect the shared store (when
    /// `REDIS_URL` is set) and pick the notifier.
    ///
    /// # Errors
    ///
    /// - `AppError::StoreConnection` if Redis is configured but unreachable
    /// - `AppError::Policy` if a route policy is invalid
    pub async fn from_config(config: Config) -> AppResult<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let store = match &config.redis_url {
            Some(url) => {
                info!("Connecting to Redis store...");
                let redis = RedisStore::connect(url)
                    .await
                    .map_err(|e| AppError::StoreConnection(e.to_string()))?;
                StoreBackend::Redis(redis)
            }
            None => {
                warn!("REDIS_URL not set; rate limits and cache are local to this instance");
                StoreBackend::Memory(MemoryStore::new(clock.clone()))
            }
        };

        let notifier: Arc<dyn Notifier> = match &config.notifier_url {
            Some(url) => Arc::new(WebhookNotifier::new(url.clone(), config.dependency_timeout)?),
            None => {
                info!("NOTIFIER_URL not set; notifications are written to the log");
                Arc::new(LogNotifier)
            }
        };

        Self::new(config, store, notifier, clock)
    }

    /// Assemble state from explicit parts. Used by `from_config` and tests.
    ///
    /// Must be called inside a Tokio runtime: the store sweeper is spawned here.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Policy` if a route policy is invalid.
    pub fn new(
        config: Config,
        store: StoreBackend,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> AppResult<Self> {
        let policies = Arc::new(RoutePolicies::from_config(&config)?);
        if config.trusted_proxies.is_empty() {
            warn!("TRUSTED_PROXIES not set; forwarding headers are trusted from any peer");
        }

        let verifier = Arc::new(CredentialVerifier::new(
            &config.verifier_config(),
            clock.clone(),
        ));
        let limiter = Arc::new(RateLimiter::new(
            store.counters(),
            clock.clone(),
            config.store_timeout,
            config.rate_limit_failure_policy,
        ));
        let breakers = Arc::new(BreakerRegistry::new(config.breaker_config()));
        // Registered up front so /stats lists it before the first call.
        breakers.get_or_create(NOTIFIER_DEPENDENCY);
        let cache = Arc::new(CacheAside::new(
            store.cache(),
            config.store_timeout,
            config.cache_single_flight,
        ));

        let state = Self {
            pipeline: Pipeline::new(verifier, limiter, breakers, cache),
            policies,
            reports: ReportStore::seeded(clock.now()),
            notifications: NotificationService::new(notifier),
            store,
            trusted_proxies: Arc::new(TrustedProxies::new(&config.trusted_proxies)),
            started_at: Instant::now(),
            config: Arc::new(config),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        state.spawn_store_sweeper();

        Ok(state)
    }

    /// Spawn the periodic sweeper that reclaims expired in-memory entries
    /// and idle local fallback limiter keys.
    fn spawn_store_sweeper(&self) {
        let memory = match &self.store {
            StoreBackend::Memory(memory) => Some(memory.clone()),
            StoreBackend::Redis(_) => None,
        };
        let limiter = self.pipeline.limiter().clone();
        let period = self.config.store_sweep_interval;
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await; // Skip the first immediate tick

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Store sweeper received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Some(memory) = &memory {
                            let removed = memory.purge_expired().await;
                            trace!(removed, "Store sweep complete");
                        }
                        limiter.purge_fallback();
                    }
                }
            }

            debug!("Store sweeper shutting down");
        });
    }

    /// Check the shared store answers within the store timeout.
    pub async fn store_reachable(&self) -> bool {
        let timeout: Duration = self.config.store_timeout;
        match tokio::time::timeout(timeout, self.store.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "Store ping failed");
                false
            }
            Err(_) => {
                warn!(?timeout, "Store ping timed out");
                false
            }
        }
    }

    /// Gracefully shutdown all background tasks.
    ///
    /// This method:
    /// 1. Signals all tasks to stop via cancellation token
    /// 2. Closes the task tracker (prevents new tasks)
    /// 3. Waits for all tasks to complete
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All background tasks have completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::CacheStore;

    fn memory_state(clock: Arc<ManualClock>) -> (AppState, MemoryStore) {
        let memory = MemoryStore::new(clock.clone());
        let config = Config {
            store_sweep_interval: Duration::from_secs(10),
            ..Config::default()
        };
        let state = AppState::new(
            config,
            StoreBackend::Memory(memory.clone()),
            Arc::new(LogNotifier),
            clock,
        )
        .unwrap();
        (state, memory)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_expired_entries() {
        let clock = Arc::new(ManualClock::from_millis(1_705_315_800_000));
        let (state, memory) = memory_state(clock.clone());

        memory.set("k", b"v", Duration::from_secs(5)).await.unwrap();
        assert_eq!(memory.len().await, 1);

        clock.advance(Duration::from_secs(6));
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert!(memory.is_empty().await);
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_notifier_breaker_registered() {
        let (state, _) = memory_state(Arc::new(ManualClock::from_millis(0)));

        let snapshots = state.pipeline.breakers().snapshots();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].name, NOTIFIER_DEPENDENCY);
        assert!(state.store_reachable().await);

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (state, _) = memory_state(Arc::new(ManualClock::from_millis(0)));
        state.shutdown().await;
        state.shutdown().await;
    }
}
