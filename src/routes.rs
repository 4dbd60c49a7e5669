//! Application routing configuration with middleware stack.
//!
//! # Middleware Stack (applied in order)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← Sets X-Request-Id when absent
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response logging
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │  Propagate ID    │ ← Copies X-Request-Id onto the response
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │      CORS        │ ← Cross-origin headers
//! └────────┬─────────┘
//!          │
//!          ▼
//!   Handler → Pipeline(route policy) → Outcome
//! ```
//!
//! Authentication, rate limiting, circuit breaking and caching are not tower
//! layers: each protected route runs its own [`RoutePolicy`] through the
//! pipeline, so the stage list is visible per route below.
//!
//! # Route Groups
//!
//! - `/health`, `/ready` - Health & monitoring (no pipeline)
//! - `/me` - Any authenticated caller
//! - `/reports/{id}` - Analysts; cache-aside over the report store
//! - `/notifications` - Operators; circuit breaker around the notifier
//! - `/stats`, `/breakers/{name}/close` - Admins

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::HeaderName;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::handlers;
use crate::middleware::REQUEST_ID_HEADER;
use crate::pipeline::{PolicyError, RateKeyScope, RoutePolicy, Stage};
use crate::state::AppState;

/// Breaker name of the notification dependency.
pub const NOTIFIER_DEPENDENCY: &str = "notifier";

/// Maximum accepted request body (notifications are small).
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// The validated policy of every protected route.
#[derive(Debug, Clone)]
pub struct RoutePolicies {
    pub me: RoutePolicy,
    pub reports: RoutePolicy,
    pub notifications: RoutePolicy,
    pub stats: RoutePolicy,
    pub breaker_admin: RoutePolicy,
}

impl RoutePolicies {
    /// Build every route policy from configuration.
    ///
    /// # Errors
    ///
    /// Returns the first [`PolicyError`] found; the server refuses to start.
    pub fn from_config(config: &Config) -> Result<Self, PolicyError> {
        let budget = || Stage::rate_limit(config.rate_limit_requests, config.rate_limit_window);

        Ok(Self {
            me: RoutePolicy::new(
                "me",
                vec![
                    Stage::authenticate(),
                    Stage::rate_limit_by(
                        config.rate_limit_requests,
                        config.rate_limit_window,
                        RateKeyScope::Identity,
                    ),
                ],
            )?,
            reports: RoutePolicy::new(
                "reports",
                vec![
                    Stage::authorize(&["analyst", "admin"]),
                    budget(),
                    Stage::cache_aside(config.cache_ttl),
                ],
            )?,
            notifications: RoutePolicy::new(
                "notifications",
                vec![
                    Stage::authorize(&["operator", "admin"]),
                    budget(),
                    Stage::circuit_breaker(NOTIFIER_DEPENDENCY, config.dependency_timeout),
                ],
            )?,
            stats: RoutePolicy::new("stats", vec![Stage::authorize(&["admin"]), budget()])?,
            breaker_admin: RoutePolicy::new(
                "breaker_admin",
                vec![Stage::authorize(&["admin"]), budget()],
            )?,
        })
    }
}

/// Build the application router with all routes and middleware configured.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()` so
/// client IPs can be checked against `TRUSTED_PROXIES`.
pub fn build_router(state: AppState) -> Router {
    let config = &state.config;

    let cors = build_cors_layer(&config.cors_allowed_origins);
    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);

    info!(
        store = state.store.name(),
        requests = config.rate_limit_requests,
        window_secs = config.rate_limit_window.as_secs(),
        failure_policy = %config.rate_limit_failure_policy,
        trusted_proxies = config.trusted_proxies.len(),
        "Route pipeline configured"
    );

    Router::new()
        // Health and status endpoints (no pipeline)
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        // Protected routes
        .route("/me", get(handlers::me))
        .route("/reports/{id}", get(handlers::get_report))
        .route("/notifications", post(handlers::send_notification))
        .route("/stats", get(handlers::stats))
        .route("/breakers/{name}/close", post(handlers::close_breaker))
        // Middleware (applied bottom to top)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .layer(PropagateRequestIdLayer::new(request_id.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid))
        .with_state(state)
}

/// Build CORS layer from configuration.
///
/// # Security Note
///
/// Using `*` (any origin) is convenient for development but should be
/// avoided in production. Specify explicit origins instead.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_any = allowed_origins.iter().any(|o| o == "*");

    if allow_any {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
