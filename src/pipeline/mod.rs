//! Per-route request pipeline.
//!
//! A [`RoutePolicy`] lists the stages a route runs. The [`Pipeline`] executes
//! them for one request and always produces exactly one [`Outcome`]:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Gates (sequential, may short-circuit)                      │
//! │    Authorize → verify credential → role check               │
//! │    RateLimit → count request against rl:<key>:<window>      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Wraps (nested, first declared is outermost)                │
//! │    CacheAside(ttl)                                          │
//! │      CircuitBreaker(dependency, timeout)                    │
//! │        handler(RequestScope)                                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The handler only ever sees an [`Identity`] produced by a successful
//! credential check. A breaker may only sit inside the cache, so it records
//! calls that actually reached the dependency.

mod route;

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{Instrument, debug, info_span};

use crate::auth::{CredentialVerifier, Identity, Rejection, authorize, bearer_token};
use crate::failure::{Failure, FailureKind, Outcome};
use crate::metrics;
use crate::resilience::{
    BreakerError, BreakerRegistry, CacheAside, CacheKey, RateLimitPolicy, RateLimiter,
};

pub use route::{PolicyError, RateKeyScope, RoutePolicy, Stage};

/// Transport-level facts about one request, captured before the pipeline runs.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Resolved client address (see `middleware::ip`)
    pub client_ip: String,
    /// Raw `Authorization` header value, if present
    pub authorization: Option<String>,
    /// Request path
    pub path: String,
    /// Raw query string, if present
    pub query: Option<String>,
    /// Correlation id set by the request-id layer
    pub request_id: Option<String>,
}

/// What a handler receives once every gate has passed.
#[derive(Debug, Clone)]
pub struct RequestScope {
    /// Present only on routes with an `Authorize` stage.
    pub identity: Option<Identity>,
    pub context: RequestContext,
}

/// Executes route policies against the shared resilience components.
#[derive(Clone)]
pub struct Pipeline {
    verifier: Arc<CredentialVerifier>,
    limiter: Arc<RateLimiter>,
    breakers: Arc<BreakerRegistry>,
    cache: Arc<CacheAside>,
}

impl Pipeline {
    pub fn new(
        verifier: Arc<CredentialVerifier>,
        limiter: Arc<RateLimiter>,
        breakers: Arc<BreakerRegistry>,
        cache: Arc<CacheAside>,
    ) -> Self {
        Self {
            verifier,
            limiter,
            breakers,
            cache,
        }
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Run `handler` behind every stage of `policy`.
    pub async fn run<T, H, Fut>(&self, policy: &RoutePolicy, context: RequestContext, handler: H) -> Outcome<T>
    where
        T: Serialize + DeserializeOwned,
        H: FnOnce(RequestScope) -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        let span = info_span!(
            "pipeline",
            route = %policy.name(),
            client = %context.client_ip,
            request_id = context.request_id.as_deref().unwrap_or("-"),
        );

        let outcome: Outcome<T> = self
            .execute(policy, context, handler)
            .instrument(span)
            .await
            .into();

        let status = match &outcome {
            Outcome::Success(_) => 200,
            Outcome::Failure(failure) => failure.status().as_u16(),
        };
        metrics::record_pipeline_outcome(policy.name(), status);
        outcome
    }

    async fn execute<T, H, Fut>(&self, policy: &RoutePolicy, context: RequestContext, handler: H) -> Result<T, Failure>
    where
        T: Serialize + DeserializeOwned,
        H: FnOnce(RequestScope) -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        let identity = self.run_gates(policy, &context).await?;

        let cache_key = CacheKey::for_request(policy.name(), &context.path, context.query.as_deref());
        let scope = RequestScope { identity, context };

        match policy.wraps() {
            [] => handler(scope).await,
            [only] => self.wrap(only, &cache_key, || handler(scope)).await,
            [outer, inner] => {
                self.wrap(outer, &cache_key, || {
                    self.wrap(inner, &cache_key, || handler(scope))
                })
                .await
            }
            _ => Err(Failure::internal(format!(
                "route '{}' declares more wrapping stages than exist",
                policy.name()
            ))),
        }
    }

    /// Run gate stages in order; the first failure ends the request.
    async fn run_gates(&self, policy: &RoutePolicy, context: &RequestContext) -> Result<Option<Identity>, Failure> {
        let mut identity: Option<Identity> = None;

        for stage in policy.gates() {
            match stage {
                Stage::Authorize { roles } => {
                    let verified = self.authenticate(context).await?;
                    authorize(Some(&verified), roles)?;
                    debug!(subject = %verified.subject(), "Caller authorized");
                    identity = Some(verified);
                }
                Stage::RateLimit {
                    limit,
                    window,
                    scope,
                } => {
                    let key = scope.key(identity.as_ref(), &context.client_ip);
                    self.limiter
                        .admit(&key, &RateLimitPolicy::new(*limit, *window))
                        .await?;
                }
                Stage::CircuitBreaker { .. } | Stage::CacheAside { .. } => {}
            }
        }

        Ok(identity)
    }

    async fn authenticate(&self, context: &RequestContext) -> Result<Identity, Failure> {
        let Some(header) = context.authorization.as_deref() else {
            return Err(Rejection::Missing.into());
        };
        let Some(token) = bearer_token(header) else {
            return Err(Rejection::Malformed.into());
        };
        self.verifier.authenticate(token).await
    }

    async fn wrap<T, F, Fut>(&self, stage: &Stage, cache_key: &CacheKey, next: F) -> Result<T, Failure>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        match stage {
            Stage::CircuitBreaker {
                dependency,
                timeout,
            } => self.guarded(dependency, *timeout, next).await,
            Stage::CacheAside { ttl } => self.cache.read_through(cache_key, *ttl, next).await,
            Stage::Authorize { .. } | Stage::RateLimit { .. } => next().await,
        }
    }

    /// Call through the dependency's breaker.
    ///
    /// Client-class failures (4xx) mean the dependency answered; they pass
    /// through unchanged and count as successful calls. Dependency failures
    /// pass through and trip the breaker. Anything else is reported as a
    /// `DependencyError` for this dependency.
    async fn guarded<T, F, Fut>(&self, dependency: &str, timeout: std::time::Duration, next: F) -> Result<T, Failure>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        let breaker = self.breakers.get_or_create(dependency);
        let result = breaker
            .call(
                || async move {
                    match next().await {
                        Err(failure) if failure.status().is_client_error() => Ok(Err(failure)),
                        other => other.map(Ok),
                    }
                },
                timeout,
            )
            .await;

        match result {
            Ok(inner) => inner,
            Err(BreakerError::Dependency(failure)) if failure.kind().is_dependency() => Err(failure),
            Err(BreakerError::Dependency(failure)) if failure.kind() == FailureKind::Internal => {
                let cause = failure.cause().unwrap_or(failure.message()).to_string();
                Err(Failure::dependency_error(dependency, cause))
            }
            Err(other) => Err(other.into_failure(dependency)),
        }
    }
}
