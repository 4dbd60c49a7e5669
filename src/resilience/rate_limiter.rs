//! Fixed-window request counting against a shared counter store.
//!
//! # Algorithm
//!
//! ```text
//! window_id = floor(now_ms / window_ms)
//! count     = INCR rl:<rate-key>:<window_id>   (TTL = window on creation)
//! count > limit  →  RateLimited, retry after the window boundary
//! ```
//!
//! Windows are aligned to the Unix epoch, so every instance sharing the store
//! agrees on window boundaries without coordination. Counters disappear by
//! TTL; nothing ever resets them explicitly.
//!
//! # Store Failures
//!
//! Every store call is bounded by `store_timeout`. When the store errors or
//! times out, [`StoreFailurePolicy`] decides:
//!
//! - `FailOpen`: admit and log a warning (default)
//! - `FailClosed`: reject with `DependencyUnavailable`
//! - `LocalFallback`: enforce the same budget with a per-process governor
//!   limiter until the store answers again

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use governor::clock::{Clock as _, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter as GovernorLimiter};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::failure::Failure;
use crate::metrics;
use crate::store::{CounterStore, StoreError, bounded, duration_millis};

/// Per-process limiter used while the shared store is unreachable.
type KeyedLimiter = GovernorLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Caller-scoping key: `ip:<addr>` or `user:<subject>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey(String);

impl RateKey {
    pub fn ip(addr: &str) -> Self {
        Self(format!("ip:{addr}"))
    }

    pub fn user(subject: &str) -> Self {
        Self(format!("user:{subject}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request budget for one route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RateLimitPolicy {
    /// Maximum admitted requests per window
    pub limit: u32,
    /// Window length
    pub window: Duration,
}

impl RateLimitPolicy {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }
}

/// Behaviour when the counter store fails or times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreFailurePolicy {
    #[default]
    FailOpen,
    FailClosed,
    LocalFallback,
}

impl FromStr for StoreFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" | "fail_open" => Ok(Self::FailOpen),
            "closed" | "fail_closed" => Ok(Self::FailClosed),
            "local" | "local_fallback" => Ok(Self::LocalFallback),
            other => Err(format!(
                "unknown rate limit failure policy '{other}' (expected open, closed or local)"
            )),
        }
    }
}

impl StoreFailurePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FailOpen => "open",
            Self::FailClosed => "closed",
            Self::LocalFallback => "local",
        }
    }
}

impl fmt::Display for StoreFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An admitted request's view of its budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub limit: u32,
    pub remaining: u32,
    /// Time until the current window ends
    pub reset_after: Duration,
    /// Admitted without consulting the shared store
    pub degraded: bool,
}

pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
    failure_policy: StoreFailurePolicy,
    fallback: Mutex<HashMap<RateLimitPolicy, Arc<KeyedLimiter>>>,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        store_timeout: Duration,
        failure_policy: StoreFailurePolicy,
    ) -> Self {
        Self {
            store,
            clock,
            store_timeout,
            failure_policy,
            fallback: Mutex::new(HashMap::new()),
        }
    }

    pub fn failure_policy(&self) -> StoreFailurePolicy {
        self.failure_policy
    }

    /// Count one request for `key` and decide whether to admit it.
    ///
    /// # Errors
    ///
    /// - `RateLimited` with a retry hint once the window budget is spent
    /// - `DependencyUnavailable` when the store fails under `FailClosed`
    pub async fn admit(&self, key: &RateKey, policy: &RateLimitPolicy) -> Result<Admission, Failure> {
        let window_ms = duration_millis(policy.window).max(1);
        let now_ms = self.clock.now_millis();
        let window_id = now_ms / window_ms;
        let reset_after = Duration::from_millis(window_ms - now_ms % window_ms);
        let counter_key = format!("rl:{key}:{window_id}");

        let counted = bounded(
            self.store_timeout,
            self.store.incr_with_ttl(&counter_key, policy.window),
        )
        .await;

        match counted {
            Ok(count) if count > u64::from(policy.limit) => {
                info!(
                    client = %key,
                    count,
                    limit = policy.limit,
                    "Rate limit exceeded"
                );
                metrics::record_rate_limit_decision("rejected");
                Err(Failure::rate_limited(reset_after))
            }
            Ok(count) => {
                metrics::record_rate_limit_decision("admitted");
                let remaining = u64::from(policy.limit).saturating_sub(count);
                Ok(Admission {
                    limit: policy.limit,
                    remaining: u32::try_from(remaining).unwrap_or(u32::MAX),
                    reset_after,
                    degraded: false,
                })
            }
            Err(e) => self.on_store_failure(key, policy, reset_after, e),
        }
    }

    fn on_store_failure(
        &self,
        key: &RateKey,
        policy: &RateLimitPolicy,
        reset_after: Duration,
        error: StoreError,
    ) -> Result<Admission, Failure> {
        metrics::record_store_error("counter", error.as_str(), self.failure_policy.as_str());

        match self.failure_policy {
            StoreFailurePolicy::FailOpen => {
                warn!(client = %key, error = %error, "Counter store failed; admitting request");
                metrics::record_rate_limit_decision("degraded");
                Ok(Admission {
                    limit: policy.limit,
                    remaining: policy.limit,
                    reset_after,
                    degraded: true,
                })
            }
            StoreFailurePolicy::FailClosed => {
                warn!(client = %key, error = %error, "Counter store failed; rejecting request");
                Err(Failure::dependency_unavailable("Rate limit store").with_cause(error))
            }
            StoreFailurePolicy::LocalFallback => {
                warn!(client = %key, error = %error, "Counter store failed; using local limiter");
                let Some(limiter) = self.fallback_limiter(policy) else {
                    return Ok(Admission {
                        limit: policy.limit,
                        remaining: policy.limit,
                        reset_after,
                        degraded: true,
                    });
                };
                match limiter.check_key(&key.to_string()) {
                    Ok(()) => {
                        metrics::record_rate_limit_decision("admitted_local");
                        Ok(Admission {
                            limit: policy.limit,
                            remaining: 0,
                            reset_after,
                            degraded: true,
                        })
                    }
                    Err(not_until) => {
                        metrics::record_rate_limit_decision("rejected_local");
                        let wait = not_until.wait_time_from(DefaultClock::default().now());
                        Err(Failure::rate_limited(wait))
                    }
                }
            }
        }
    }

    /// Governor limiter with the same budget as `policy`, spread evenly over
    /// the window. `None` for a zero limit or window.
    fn fallback_limiter(&self, policy: &RateLimitPolicy) -> Option<Arc<KeyedLimiter>> {
        let mut limiters = self.fallback.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(limiter) = limiters.get(policy) {
            return Some(limiter.clone());
        }

        let burst = NonZeroU32::new(policy.limit)?;
        let quota = Quota::with_period(policy.window / policy.limit)?.allow_burst(burst);
        let limiter = Arc::new(GovernorLimiter::keyed(quota));
        limiters.insert(*policy, limiter.clone());
        Some(limiter)
    }

    /// Drop idle keys from the local fallback limiters.
    pub fn purge_fallback(&self) {
        let limiters = self.fallback.lock().unwrap_or_else(PoisonError::into_inner);
        for limiter in limiters.values() {
            limiter.retain_recent();
            limiter.shrink_to_fit();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::failure::FailureKind;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    /// Counter store that always fails.
    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn incr_with_ttl(&self, _key: &str, _ttl: Duration) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    /// Counter store that never answers.
    struct HangingStore;

    #[async_trait]
    impl CounterStore for HangingStore {
        async fn incr_with_ttl(&self, _key: &str, _ttl: Duration) -> Result<u64, StoreError> {
            std::future::pending().await
        }
    }

    // 2024-01-15T10:50:00Z, exactly on a minute boundary
    const START_MS: i64 = 1_705_315_800_000;

    fn limiter(policy: StoreFailurePolicy) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::from_millis(START_MS));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        (
            RateLimiter::new(store, clock.clone(), Duration::from_millis(100), policy),
            clock,
        )
    }

    fn broken(store: Arc<dyn CounterStore>, policy: StoreFailurePolicy) -> RateLimiter {
        let clock = Arc::new(ManualClock::from_millis(START_MS));
        RateLimiter::new(store, clock, Duration::from_millis(100), policy)
    }

    #[tokio::test]
    async fn test_scenario_sixth_request_rejected() {
        let (limiter, clock) = limiter(StoreFailurePolicy::FailOpen);
        clock.advance(Duration::from_secs(15));
        let key = RateKey::ip("1.2.3.4");
        let policy = RateLimitPolicy::new(5, Duration::from_secs(60));

        for expected_remaining in (0..5).rev() {
            let admission = limiter.admit(&key, &policy).await.unwrap();
            assert_eq!(admission.remaining, expected_remaining);
            assert!(!admission.degraded);
        }

        let failure = limiter.admit(&key, &policy).await.unwrap_err();
        assert_eq!(failure.kind(), FailureKind::RateLimited);
        let retry_after = failure.retry_after().unwrap();
        assert!(retry_after > Duration::ZERO);
        assert!(retry_after <= Duration::from_secs(60));
        assert_eq!(retry_after, Duration::from_secs(45));
    }

    #[tokio::test]
    async fn test_keys_are_counted_separately() {
        let (limiter, _) = limiter(StoreFailurePolicy::FailOpen);
        let policy = RateLimitPolicy::new(1, Duration::from_secs(60));

        assert!(limiter.admit(&RateKey::ip("1.1.1.1"), &policy).await.is_ok());
        assert!(limiter.admit(&RateKey::user("alice"), &policy).await.is_ok());
        assert!(limiter.admit(&RateKey::ip("1.1.1.1"), &policy).await.is_err());
    }

    #[tokio::test]
    async fn test_next_window_restores_budget() {
        let (limiter, clock) = limiter(StoreFailurePolicy::FailOpen);
        let key = RateKey::user("alice");
        let policy = RateLimitPolicy::new(2, Duration::from_secs(60));

        limiter.admit(&key, &policy).await.unwrap();
        limiter.admit(&key, &policy).await.unwrap();
        assert!(limiter.admit(&key, &policy).await.is_err());

        clock.advance(Duration::from_secs(60));
        assert!(limiter.admit(&key, &policy).await.is_ok());
    }

    #[tokio::test]
    async fn test_retry_after_rounds_up_to_one_second() {
        let (limiter, clock) = limiter(StoreFailurePolicy::FailOpen);
        let key = RateKey::ip("9.9.9.9");
        let policy = RateLimitPolicy::new(1, Duration::from_secs(60));

        clock.advance(Duration::from_millis(59_800));
        limiter.admit(&key, &policy).await.unwrap();
        let failure = limiter.admit(&key, &policy).await.unwrap_err();
        assert_eq!(failure.retry_after(), Some(Duration::from_millis(200)));
        assert_eq!(failure.retry_after_secs(), Some(1));
    }

    #[tokio::test]
    async fn test_fail_open_admits_on_store_error() {
        let limiter = broken(Arc::new(BrokenStore), StoreFailurePolicy::FailOpen);
        let policy = RateLimitPolicy::new(1, Duration::from_secs(60));
        for _ in 0..5 {
            let admission = limiter.admit(&RateKey::ip("1.2.3.4"), &policy).await.unwrap();
            assert!(admission.degraded);
        }
    }

    #[tokio::test]
    async fn test_fail_closed_rejects_on_store_error() {
        let limiter = broken(Arc::new(BrokenStore), StoreFailurePolicy::FailClosed);
        let policy = RateLimitPolicy::new(10, Duration::from_secs(60));
        let failure = limiter.admit(&RateKey::ip("1.2.3.4"), &policy).await.unwrap_err();
        assert_eq!(failure.kind(), FailureKind::DependencyUnavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_timeout_applies_policy() {
        let limiter = broken(Arc::new(HangingStore), StoreFailurePolicy::FailClosed);
        let policy = RateLimitPolicy::new(10, Duration::from_secs(60));
        let failure = limiter.admit(&RateKey::ip("1.2.3.4"), &policy).await.unwrap_err();
        assert_eq!(failure.kind(), FailureKind::DependencyUnavailable);
    }

    #[tokio::test]
    async fn test_local_fallback_enforces_budget() {
        let limiter = broken(Arc::new(BrokenStore), StoreFailurePolicy::LocalFallback);
        let policy = RateLimitPolicy::new(2, Duration::from_secs(60));
        let key = RateKey::ip("1.2.3.4");

        assert!(limiter.admit(&key, &policy).await.unwrap().degraded);
        assert!(limiter.admit(&key, &policy).await.is_ok());
        let failure = limiter.admit(&key, &policy).await.unwrap_err();
        assert_eq!(failure.kind(), FailureKind::RateLimited);
        assert!(failure.retry_after().unwrap() > Duration::ZERO);

        // Other callers keep their own budget.
        assert!(limiter.admit(&RateKey::ip("5.6.7.8"), &policy).await.is_ok());
    }

    #[test]
    fn test_failure_policy_parsing() {
        assert_eq!("open".parse(), Ok(StoreFailurePolicy::FailOpen));
        assert_eq!("CLOSED".parse(), Ok(StoreFailurePolicy::FailClosed));
        assert_eq!("local".parse(), Ok(StoreFailurePolicy::LocalFallback));
        assert!("sometimes".parse::<StoreFailurePolicy>().is_err());
    }
}
