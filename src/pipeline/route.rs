use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::auth::Identity;
use crate::resilience::RateKey;

/// Which caller attribute a rate limit counts against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateKeyScope {
    /// Client IP address
    Ip,
    /// Authenticated subject; requires an earlier `Authorize` stage
    Identity,
    /// Subject when authenticated, otherwise client IP
    #[default]
    IdentityOrIp,
}

impl RateKeyScope {
    /// Build the rate key for a request.
    ///
    /// `Identity` without an identity falls back to the IP key; route
    /// validation prevents that combination from being configured.
    pub fn key(self, identity: Option<&Identity>, client_ip: &str) -> RateKey {
        match (self, identity) {
            (RateKeyScope::Identity | RateKeyScope::IdentityOrIp, Some(identity)) => {
                RateKey::user(identity.subject())
            }
            _ => RateKey::ip(client_ip),
        }
    }
}

/// One step of a route's pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    /// Verify the bearer credential and require one of `roles` (any role when empty).
    Authorize { roles: BTreeSet<String> },
    /// Fixed-window request budget.
    RateLimit {
        limit: u32,
        window: Duration,
        scope: RateKeyScope,
    },
    /// Run the rest of the chain through the named dependency's breaker.
    CircuitBreaker { dependency: String, timeout: Duration },
    /// Serve the rest of the chain's result from the cache when possible.
    CacheAside { ttl: Duration },
}

impl Stage {
    pub fn authorize(roles: &[&str]) -> Self {
        Stage::Authorize {
            roles: roles.iter().map(|r| (*r).to_string()).collect(),
        }
    }

    /// Authenticate without a role requirement.
    pub fn authenticate() -> Self {
        Stage::Authorize {
            roles: BTreeSet::new(),
        }
    }

    pub fn rate_limit(limit: u32, window: Duration) -> Self {
        Stage::RateLimit {
            limit,
            window,
            scope: RateKeyScope::default(),
        }
    }

    pub fn rate_limit_by(limit: u32, window: Duration, scope: RateKeyScope) -> Self {
        Stage::RateLimit {
            limit,
            window,
            scope,
        }
    }

    pub fn circuit_breaker(dependency: &str, timeout: Duration) -> Self {
        Stage::CircuitBreaker {
            dependency: dependency.to_string(),
            timeout,
        }
    }

    pub fn cache_aside(ttl: Duration) -> Self {
        Stage::CacheAside { ttl }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Authorize { .. } => "authorize",
            Stage::RateLimit { .. } => "rate_limit",
            Stage::CircuitBreaker { .. } => "circuit_breaker",
            Stage::CacheAside { .. } => "cache_aside",
        }
    }

    /// Gates run before the handler and may only short-circuit; the rest
    /// wrap the handler.
    pub fn is_gate(&self) -> bool {
        matches!(self, Stage::Authorize { .. } | Stage::RateLimit { .. })
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a route policy was rejected at startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("route name must not be empty")]
    EmptyName,

    #[error("route '{route}': stage '{stage}' appears more than once")]
    DuplicateStage { route: String, stage: &'static str },

    #[error("route '{route}': gate stage '{gate}' must come before wrapping stage '{wrap}'")]
    GateAfterWrap {
        route: String,
        gate: &'static str,
        wrap: &'static str,
    },

    #[error("route '{route}': identity-scoped rate limit requires an earlier authorize stage")]
    IdentityScopeWithoutAuthorize { route: String },

    #[error("route '{route}': stage '{stage}' has an invalid {field}: must be greater than zero")]
    ZeroValue {
        route: String,
        stage: &'static str,
        field: &'static str,
    },

    #[error("route '{route}': circuit breaker dependency name must not be empty")]
    EmptyDependency { route: String },

    #[error("route '{route}': cache_aside must come before circuit_breaker so cache hits bypass the breaker")]
    BreakerOutsideCache { route: String },
}

/// A named, validated, ordered list of stages.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutePolicy {
    name: String,
    stages: Vec<Stage>,
    /// Index of the first wrapping stage
    split: usize,
}

impl RoutePolicy {
    /// Validate and build a policy.
    ///
    /// # Errors
    ///
    /// - a stage kind appears twice
    /// - a gate follows a wrapping stage
    /// - an identity-scoped rate limit has no earlier `Authorize`
    /// - a limit, window, timeout or TTL is zero
    /// - a circuit breaker is declared outside a cache-aside stage
    pub fn new(name: impl Into<String>, stages: Vec<Stage>) -> Result<Self, PolicyError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(PolicyError::EmptyName);
        }

        let mut seen: Vec<&'static str> = Vec::new();
        let mut first_wrap: Option<&'static str> = None;
        let mut authorized = false;

        for stage in &stages {
            if seen.contains(&stage.name()) {
                return Err(PolicyError::DuplicateStage {
                    route: name,
                    stage: stage.name(),
                });
            }
            seen.push(stage.name());

            if stage.is_gate() {
                if let Some(wrap) = first_wrap {
                    return Err(PolicyError::GateAfterWrap {
                        route: name,
                        gate: stage.name(),
                        wrap,
                    });
                }
            } else if first_wrap.is_none() {
                first_wrap = Some(stage.name());
            }

            let zero = |field: &'static str| PolicyError::ZeroValue {
                route: name.clone(),
                stage: stage.name(),
                field,
            };
            match stage {
                Stage::Authorize { .. } => authorized = true,
                Stage::RateLimit {
                    limit,
                    window,
                    scope,
                } => {
                    if *limit == 0 {
                        return Err(zero("limit"));
                    }
                    if window.is_zero() {
                        return Err(zero("window"));
                    }
                    if *scope == RateKeyScope::Identity && !authorized {
                        return Err(PolicyError::IdentityScopeWithoutAuthorize {
                            route: name.clone(),
                        });
                    }
                }
                Stage::CircuitBreaker {
                    dependency,
                    timeout,
                } => {
                    if dependency.trim().is_empty() {
                        return Err(PolicyError::EmptyDependency {
                            route: name.clone(),
                        });
                    }
                    if timeout.is_zero() {
                        return Err(zero("timeout"));
                    }
                }
                Stage::CacheAside { ttl } => {
                    if ttl.is_zero() {
                        return Err(zero("ttl"));
                    }
                    // A breaker wrapping the cache would count hits as
                    // dependency calls.
                    if seen.contains(&"circuit_breaker") {
                        return Err(PolicyError::BreakerOutsideCache {
                            route: name.clone(),
                        });
                    }
                }
            }
        }

        let split = stages.iter().take_while(|s| s.is_gate()).count();
        Ok(Self {
            name,
            stages,
            split,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Gate stages, in execution order.
    pub fn gates(&self) -> &[Stage] {
        self.stages.get(..self.split).unwrap_or_default()
    }

    /// Wrapping stages, outermost first.
    pub fn wraps(&self) -> &[Stage] {
        self.stages.get(self.split..).unwrap_or_default()
    }

    /// Whether the route verifies the caller's credential.
    pub fn authenticates(&self) -> bool {
        self.gates()
            .iter()
            .any(|s| matches!(s, Stage::Authorize { .. }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_full_policy_splits_gates_and_wraps() {
        let policy = RoutePolicy::new(
            "reports",
            vec![
                Stage::authorize(&["analyst"]),
                Stage::rate_limit(100, MINUTE),
                Stage::cache_aside(Duration::from_secs(30)),
                Stage::circuit_breaker("warehouse", Duration::from_secs(2)),
            ],
        )
        .unwrap();

        assert_eq!(policy.gates().len(), 2);
        assert_eq!(policy.wraps().len(), 2);
        assert_eq!(policy.wraps()[0].name(), "cache_aside");
        assert!(policy.authenticates());
    }

    #[test]
    fn test_empty_policy_is_valid() {
        let policy = RoutePolicy::new("health", vec![]).unwrap();
        assert!(policy.gates().is_empty());
        assert!(policy.wraps().is_empty());
        assert!(!policy.authenticates());
    }

    #[test]
    fn test_duplicate_stage_rejected() {
        let err = RoutePolicy::new(
            "dup",
            vec![Stage::rate_limit(1, MINUTE), Stage::rate_limit(2, MINUTE)],
        )
        .unwrap_err();
        assert!(matches!(err, PolicyError::DuplicateStage { stage: "rate_limit", .. }));
    }

    #[test]
    fn test_gate_after_wrap_rejected() {
        let err = RoutePolicy::new(
            "bad-order",
            vec![
                Stage::cache_aside(MINUTE),
                Stage::authorize(&["admin"]),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, PolicyError::GateAfterWrap { gate: "authorize", .. }));
    }

    #[test]
    fn test_breaker_outside_cache_rejected() {
        let err = RoutePolicy::new(
            "reports",
            vec![
                Stage::circuit_breaker("warehouse", Duration::from_secs(2)),
                Stage::cache_aside(MINUTE),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, PolicyError::BreakerOutsideCache { .. }));
    }

    #[test]
    fn test_identity_scope_requires_authorize_first() {
        let err = RoutePolicy::new(
            "me",
            vec![
                Stage::rate_limit_by(10, MINUTE, RateKeyScope::Identity),
                Stage::authenticate(),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, PolicyError::IdentityScopeWithoutAuthorize { .. }));

        assert!(
            RoutePolicy::new(
                "me",
                vec![
                    Stage::authenticate(),
                    Stage::rate_limit_by(10, MINUTE, RateKeyScope::Identity),
                ],
            )
            .is_ok()
        );
    }

    #[test]
    fn test_zero_values_rejected() {
        let err = RoutePolicy::new("z", vec![Stage::rate_limit(0, MINUTE)]).unwrap_err();
        assert!(matches!(err, PolicyError::ZeroValue { field: "limit", .. }));

        let err = RoutePolicy::new("z", vec![Stage::cache_aside(Duration::ZERO)]).unwrap_err();
        assert!(matches!(err, PolicyError::ZeroValue { field: "ttl", .. }));
    }

    #[test]
    fn test_rate_key_scope() {
        let now = Utc::now();
        let alice = Identity::new("alice".to_string(), BTreeSet::new(), now, now);

        assert_eq!(
            RateKeyScope::IdentityOrIp.key(Some(&alice), "1.2.3.4").as_str(),
            "user:alice"
        );
        assert_eq!(
            RateKeyScope::IdentityOrIp.key(None, "1.2.3.4").as_str(),
            "ip:1.2.3.4"
        );
        assert_eq!(
            RateKeyScope::Ip.key(Some(&alice), "1.2.3.4").as_str(),
            "ip:1.2.3.4"
        );
    }
}
