//! Circuit breaker guarding calls to a volatile dependency.
//!
//! The breaker fails fast while a dependency is known to be unhealthy, which
//! stops request pile-up and gives the dependency room to recover.
//!
//! # States
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                        Circuit Breaker                             │
//! │                                                                    │
//! │  ┌─────────┐  failure rate ≥ threshold  ┌─────────┐                │
//! │  │  Closed │ ─────────────────────────► │  Open   │                │
//! │  │ (Normal)│  (after minimum samples)   │ (Fail   │                │
//! │  └────┬────┘                            │  Fast)  │                │
//! │       ▲                                 └────┬────┘                │
//! │       │                                      │ reset timeout       │
//! │       │                                      ▼                     │
//! │       │          trial success       ┌───────────────┐             │
//! │       └───────────────────────────── │   HalfOpen    │             │
//! │                                      │ (exactly one  │             │
//! │                                      │  trial)       │             │
//! │                                      └───────┬───────┘             │
//! │                                              │ trial failure       │
//! │                                              ▼                     │
//! │                                         back to Open               │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Statistics
//!
//! Closed-state outcomes enter a rolling window of the last `window_size`
//! calls. Timeouts count as failures. Calls rejected while open never enter
//! the window.
//!
//! Every transition bumps a generation counter. A call records its outcome
//! only if the breaker is still in the generation that admitted it, so a slow
//! call admitted before a trip cannot close or re-open the circuit later.
//!
//! # Usage
//!
//! ```rust,ignore
//! let breaker = CircuitBreaker::new("sms-gateway", CircuitBreakerConfig::default());
//!
//! let receipt = breaker
//!     .call(|| gateway.send(message), Duration::from_secs(2))
//!     .await
//!     .map_err(|e| e.into_failure("sms-gateway"))?;
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::failure::Failure;
use crate::metrics;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all requests pass through.
    Closed,
    /// Failing fast - all requests are rejected immediately.
    Open,
    /// Testing recovery - exactly one trial request is let through.
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding for the state gauge (0 closed, 1 half-open, 2 open).
    pub fn as_gauge(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failure ratio (0.0 to 1.0) at or above which the circuit opens.
    pub failure_rate_threshold: f64,
    /// Minimum outcomes in the window before the rate is evaluated.
    pub minimum_samples: u32,
    /// Number of most recent outcomes kept in the rolling window.
    pub window_size: u32,
    /// How long to stay open before admitting a trial.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            minimum_samples: 10,
            window_size: 20,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Why a guarded call did not produce a value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BreakerError<E> {
    /// The circuit is open (or a half-open trial is already in flight); the
    /// dependency was not invoked.
    #[error("circuit open")]
    Open { retry_after: Option<Duration> },

    /// The dependency did not answer within the call timeout.
    #[error("dependency call timed out after {0:?}")]
    Timeout(Duration),

    /// The dependency answered with an error.
    #[error("dependency error: {0}")]
    Dependency(E),
}

impl<E: fmt::Display> BreakerError<E> {
    /// Classify into a request failure for `dependency`.
    pub fn into_failure(self, dependency: &str) -> Failure {
        match self {
            BreakerError::Open { retry_after } => {
                let failure = Failure::dependency_unavailable(dependency);
                match retry_after {
                    Some(after) => failure.with_retry_after(after),
                    None => failure,
                }
            }
            BreakerError::Timeout(after) => Failure::dependency_timeout(dependency)
                .with_cause(format!("no response within {after:?}")),
            BreakerError::Dependency(e) => Failure::dependency_error(dependency, e),
        }
    }
}

/// Point-in-time view of a breaker, for `/stats` and tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    /// Failures in the rolling window
    pub failures: u32,
    /// Outcomes in the rolling window
    pub samples: u32,
    pub failure_rate: f64,
    /// Calls admitted since the breaker was created
    pub total_calls: u64,
    pub times_opened: u32,
    pub requests_rejected: u64,
}

/// Internal state, mutated only by `transition` and the record path.
struct BreakerState {
    state: CircuitState,
    /// Most recent outcomes, `true` for failure.
    window: VecDeque<bool>,
    failures: u32,
    total_calls: u64,
    last_state_change: Instant,
    trial_in_flight: bool,
    generation: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::new(),
            failures: 0,
            total_calls: 0,
            last_state_change: Instant::now(),
            trial_in_flight: false,
            generation: 0,
        }
    }

    fn samples(&self) -> u32 {
        u32::try_from(self.window.len()).unwrap_or(u32::MAX)
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            f64::from(self.failures) / f64::from(self.samples())
        }
    }

    fn reset_window(&mut self) {
        self.window.clear();
        self.failures = 0;
    }
}

/// Thread-safe circuit breaker for one dependency.
///
/// State lives behind a synchronous mutex that is never held across an
/// `.await`, so [`Permit`] can settle the trial slot from `Drop`.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    /// Total number of times the circuit has been opened (for metrics).
    times_opened: AtomicU32,
    /// Total number of requests rejected without invoking the dependency.
    requests_rejected: AtomicU64,
}

/// Admission ticket for one guarded call.
///
/// Recording consumes the permit. A permit dropped without recording (the
/// caller's future was cancelled) releases a half-open trial slot so a later
/// call can take it instead.
#[must_use]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    /// Whether this call is the half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.record(self.generation, false);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.record(self.generation, true);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.settled || !self.trial {
            return;
        }
        let mut state = self.breaker.lock();
        if state.generation == self.generation && state.trial_in_flight {
            state.trial_in_flight = false;
            debug!(breaker = %self.breaker.name, "Half-open trial cancelled; slot released");
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let breaker = Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::new()),
            times_opened: AtomicU32::new(0),
            requests_rejected: AtomicU64::new(0),
        };
        metrics::record_breaker_state(&breaker.name, CircuitState::Closed);
        breaker
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `invocation` through the breaker, bounded by `timeout`.
    ///
    /// The invocation is not called at all when the circuit rejects. On
    /// timeout the invocation future is dropped.
    ///
    /// # Errors
    ///
    /// - [`BreakerError::Open`] when the circuit rejects the call
    /// - [`BreakerError::Timeout`] when the call exceeds `timeout`
    /// - [`BreakerError::Dependency`] when the invocation fails
    pub async fn call<T, E, F, Fut>(&self, invocation: F, timeout: Duration) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self
            .try_acquire()
            .map_err(|retry_after| BreakerError::Open { retry_after })?;

        match tokio::time::timeout(timeout, invocation()).await {
            Ok(Ok(value)) => {
                permit.record_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                permit.record_failure();
                Err(BreakerError::Dependency(e))
            }
            Err(_) => {
                debug!(breaker = %self.name, ?timeout, "Guarded call timed out");
                permit.record_failure();
                Err(BreakerError::Timeout(timeout))
            }
        }
    }

    /// Ask for admission.
    ///
    /// Returns the retry hint on rejection: the remaining open time, or
    /// `None` while a half-open trial is in flight.
    pub fn try_acquire(&self) -> Result<Permit<'_>, Option<Duration>> {
        let mut state = self.lock();

        let trial = match state.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let elapsed = state.last_state_change.elapsed();
                if elapsed < self.config.reset_timeout {
                    drop(state);
                    return Err(self.reject(Some(self.config.reset_timeout - elapsed)));
                }
                self.transition(&mut state, CircuitState::HalfOpen);
                state.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if state.trial_in_flight {
                    drop(state);
                    return Err(self.reject(None));
                }
                state.trial_in_flight = true;
                true
            }
        };

        state.total_calls += 1;
        Ok(Permit {
            breaker: self,
            generation: state.generation,
            trial,
            settled: false,
        })
    }

    fn reject(&self, retry_after: Option<Duration>) -> Option<Duration> {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
        metrics::record_breaker_rejection(&self.name);
        retry_after
    }

    fn record(&self, generation: u64, failed: bool) {
        let mut state = self.lock();
        if state.generation != generation {
            debug!(
                breaker = %self.name,
                admitted = generation,
                current = state.generation,
                "Ignoring outcome from an earlier breaker generation"
            );
            return;
        }

        match state.state {
            CircuitState::Closed => {
                state.window.push_back(failed);
                if failed {
                    state.failures += 1;
                }
                while state.window.len() > self.config.window_size.max(1) as usize {
                    if state.window.pop_front() == Some(true) {
                        state.failures -= 1;
                    }
                }

                if state.samples() >= self.config.minimum_samples
                    && state.failure_rate() >= self.config.failure_rate_threshold
                {
                    warn!(
                        breaker = %self.name,
                        failures = state.failures,
                        samples = state.samples(),
                        reset_timeout = ?self.config.reset_timeout,
                        "Circuit breaker opened due to failure rate"
                    );
                    self.transition(&mut state, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                state.trial_in_flight = false;
                if failed {
                    warn!(breaker = %self.name, "Circuit breaker reopened after failed trial");
                    self.transition(&mut state, CircuitState::Open);
                } else {
                    info!(breaker = %self.name, "Circuit breaker closed after successful trial");
                    self.transition(&mut state, CircuitState::Closed);
                }
            }
            // Open admits nothing, so a same-generation outcome cannot arrive here.
            CircuitState::Open => {}
        }
    }

    /// The single place state changes happen.
    fn transition(&self, state: &mut BreakerState, to: CircuitState) {
        let from = state.state;
        state.state = to;
        state.last_state_change = Instant::now();
        state.generation += 1;
        state.trial_in_flight = false;
        if to != CircuitState::HalfOpen {
            state.reset_window();
        }
        if to == CircuitState::Open {
            self.times_opened.fetch_add(1, Ordering::Relaxed);
        }
        debug!(breaker = %self.name, %from, %to, generation = state.generation, "Breaker transition");
        metrics::record_breaker_transition(&self.name, from, to);
    }

    /// Get the current circuit state.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Get the number of times the circuit has been opened.
    pub fn times_opened(&self) -> u32 {
        self.times_opened.load(Ordering::Relaxed)
    }

    /// Get the number of calls rejected without invoking the dependency.
    pub fn requests_rejected(&self) -> u64 {
        self.requests_rejected.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: state.state,
            failures: state.failures,
            samples: state.samples(),
            failure_rate: state.failure_rate(),
            total_calls: state.total_calls,
            times_opened: self.times_opened(),
            requests_rejected: self.requests_rejected(),
        }
    }

    /// Force the circuit to close (manual recovery).
    pub fn force_close(&self) {
        let mut state = self.lock();
        self.transition(&mut state, CircuitState::Closed);
        info!(breaker = %self.name, "Circuit breaker forcibly closed");
    }

    /// Force the circuit to open (manual intervention).
    pub fn force_open(&self) {
        let mut state = self.lock();
        self.transition(&mut state, CircuitState::Open);
        warn!(breaker = %self.name, "Circuit breaker forcibly opened");
    }
}

/// Per-process breakers keyed by dependency name.
///
/// Breaker state is intentionally local to each instance; only counters and
/// cache entries are shared through the store.
pub struct BreakerRegistry {
    default_config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Breaker for `dependency`, created with the default config on first use.
    pub fn get_or_create(&self, dependency: &str) -> Arc<CircuitBreaker> {
        self.lock()
            .entry(dependency.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(dependency, self.default_config.clone()))
            })
            .clone()
    }

    /// Register a breaker with its own config, replacing any existing one.
    pub fn register(&self, dependency: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(dependency, config));
        self.lock().insert(dependency.to_string(), breaker.clone());
        breaker
    }

    pub fn get(&self, dependency: &str) -> Option<Arc<CircuitBreaker>> {
        self.lock().get(dependency).cloned()
    }

    /// Snapshots of every breaker, sorted by name.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self.lock().values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
