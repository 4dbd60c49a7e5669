//! Resilience stages: request budgets, dependency isolation and read caching.

pub mod cache;
pub mod circuit_breaker;
pub mod rate_limiter;

pub use cache::{CacheAside, CacheKey};
pub use circuit_breaker::{
    BreakerError, BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig,
    CircuitState, Permit,
};
pub use rate_limiter::{Admission, RateKey, RateLimitPolicy, RateLimiter, StoreFailurePolicy};
