//! Operator endpoints: statistics and manual breaker control.

use axum::extract::{Path, State};
use tracing::{instrument, warn};

use crate::failure::{Failure, Outcome};
use crate::models::{BreakerClosedResponse, StatsResponse};
use crate::pipeline::RequestContext;
use crate::state::AppState;

/// `GET /stats`: breaker snapshots and dependency counters.
///
/// # Response Body
///
/// ```json
/// {
///   "uptime_seconds": 3600,
///   "rate_limit_failure_policy": "open",
///   "report_fetches": 12,
///   "notifications_sent": 3,
///   "breakers": [{ "name": "notifier", "state": "closed", ... }]
/// }
/// ```
#[instrument(skip_all)]
pub async fn stats(State(state): State<AppState>, context: RequestContext) -> Outcome<StatsResponse> {
    let snapshot_source = state.clone();

    state
        .pipeline
        .run(&state.policies.stats, context, move |_scope| async move {
            let state = snapshot_source;
            Ok(StatsResponse {
                uptime_seconds: state.uptime_seconds(),
                rate_limit_failure_policy: state.pipeline.limiter().failure_policy().to_string(),
                report_fetches: state.reports.fetch_count(),
                notifications_sent: state.notifications.sent_count(),
                breakers: state.pipeline.breakers().snapshots(),
            })
        })
        .await
}

/// `POST /breakers/{name}/close`: force a breaker closed after an operator
/// has confirmed the dependency recovered.
#[instrument(skip(state, context))]
pub async fn close_breaker(
    State(state): State<AppState>,
    Path(name): Path<String>,
    context: RequestContext,
) -> Outcome<BreakerClosedResponse> {
    let breakers = state.pipeline.breakers().clone();

    state
        .pipeline
        .run(&state.policies.breaker_admin, context, move |scope| async move {
            let breaker = breakers
                .get(&name)
                .ok_or_else(|| Failure::not_found(format!("Breaker '{name}' not found")))?;

            breaker.force_close();
            warn!(
                breaker = %name,
                by = scope.identity.as_ref().map_or("-", |i| i.subject()),
                "Circuit breaker force-closed by operator"
            );

            Ok(BreakerClosedResponse {
                breaker: breaker.snapshot(),
            })
        })
        .await
}
