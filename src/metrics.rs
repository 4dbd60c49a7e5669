//! Prometheus metrics for the request pipeline.
//!
//! Metrics are exposed via a dedicated HTTP listener when `METRICS_PORT` is
//! non-zero. Recording functions are safe to call before (or without)
//! initialization; the `metrics` facade drops samples when no recorder is
//! installed.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `gatehouse_auth_failures_total` - Credential rejections (labels: reason)
//! - `gatehouse_rate_limit_decisions_total` - Limiter verdicts (labels: decision)
//! - `gatehouse_store_errors_total` - Store failures (labels: store, reason, policy)
//! - `gatehouse_circuit_breaker_transitions_total` - State changes (labels: breaker, from, to)
//! - `gatehouse_circuit_breaker_rejections_total` - Calls refused while open (labels: breaker)
//! - `gatehouse_cache_lookups_total` - Cache reads (labels: result)
//! - `gatehouse_pipeline_outcomes_total` - Completed requests (labels: route, status)
//!
//! ## Gauges
//! - `gatehouse_circuit_breaker_state` - 0 = closed, 1 = half-open, 2 = open (labels: breaker)

use std::net::SocketAddr;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};

use crate::error::{AppError, AppResult};
use crate::resilience::CircuitState;

/// Metric names as constants for consistency.
pub mod names {
    pub const AUTH_FAILURES_TOTAL: &str = "gatehouse_auth_failures_total";
    pub const RATE_LIMIT_DECISIONS_TOTAL: &str = "gatehouse_rate_limit_decisions_total";
    pub const STORE_ERRORS_TOTAL: &str = "gatehouse_store_errors_total";
    pub const CIRCUIT_BREAKER_TRANSITIONS_TOTAL: &str =
        "gatehouse_circuit_breaker_transitions_total";
    pub const CIRCUIT_BREAKER_REJECTIONS_TOTAL: &str = "gatehouse_circuit_breaker_rejections_total";
    pub const CIRCUIT_BREAKER_STATE: &str = "gatehouse_circuit_breaker_state";
    pub const CACHE_LOOKUPS_TOTAL: &str = "gatehouse_cache_lookups_total";
    pub const PIPELINE_OUTCOMES_TOTAL: &str = "gatehouse_pipeline_outcomes_total";
}

/// Install the Prometheus exporter and describe all metrics.
///
/// # Errors
///
/// Returns [`AppError::Metrics`] if the listener cannot be installed
/// (port in use, recorder already set).
pub fn init_metrics(metrics_addr: SocketAddr) -> AppResult<()> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| AppError::Metrics(format!("Failed to install Prometheus exporter: {e}")))?;

    describe_counter!(
        names::AUTH_FAILURES_TOTAL,
        "Total number of rejected credentials by reason"
    );
    describe_counter!(
        names::RATE_LIMIT_DECISIONS_TOTAL,
        "Total number of rate limit decisions"
    );
    describe_counter!(
        names::STORE_ERRORS_TOTAL,
        "Total number of shared store failures and the policy applied"
    );
    describe_counter!(
        names::CIRCUIT_BREAKER_TRANSITIONS_TOTAL,
        "Total number of circuit breaker state transitions"
    );
    describe_counter!(
        names::CIRCUIT_BREAKER_REJECTIONS_TOTAL,
        "Total number of calls rejected by an open circuit breaker"
    );
    describe_counter!(names::CACHE_LOOKUPS_TOTAL, "Total number of cache lookups");
    describe_counter!(
        names::PIPELINE_OUTCOMES_TOTAL,
        "Total number of pipeline outcomes by route and status"
    );

    describe_gauge!(
        names::CIRCUIT_BREAKER_STATE,
        "Circuit breaker state (0 = closed, 1 = half-open, 2 = open)"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Gates
// =============================================================================

pub fn record_auth_failure(reason: &str) {
    counter!(names::AUTH_FAILURES_TOTAL, "reason" => reason.to_string()).increment(1);
}

/// `decision` is one of `admitted`, `rejected`, `admitted_local`,
/// `rejected_local`, `degraded`.
pub fn record_rate_limit_decision(decision: &str) {
    counter!(names::RATE_LIMIT_DECISIONS_TOTAL, "decision" => decision.to_string()).increment(1);
}

/// Record a shared store failure and what was done about it.
pub fn record_store_error(store: &'static str, reason: &str, policy: &str) {
    counter!(
        names::STORE_ERRORS_TOTAL,
        "store" => store,
        "reason" => reason.to_string(),
        "policy" => policy.to_string()
    )
    .increment(1);
}

// =============================================================================
// Circuit Breaker
// =============================================================================

pub fn record_breaker_state(breaker: &str, state: CircuitState) {
    gauge!(names::CIRCUIT_BREAKER_STATE, "breaker" => breaker.to_string()).set(state.as_gauge());
}

/// Count a transition and update the state gauge.
pub fn record_breaker_transition(breaker: &str, from: CircuitState, to: CircuitState) {
    counter!(
        names::CIRCUIT_BREAKER_TRANSITIONS_TOTAL,
        "breaker" => breaker.to_string(),
        "from" => from.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
    record_breaker_state(breaker, to);
}

pub fn record_breaker_rejection(breaker: &str) {
    counter!(names::CIRCUIT_BREAKER_REJECTIONS_TOTAL, "breaker" => breaker.to_string())
        .increment(1);
}

// =============================================================================
// Cache and Pipeline
// =============================================================================

/// `result` is one of `hit`, `miss`, `undecodable`, `error`.
pub fn record_cache_lookup(result: &str) {
    counter!(names::CACHE_LOOKUPS_TOTAL, "result" => result.to_string()).increment(1);
}

pub fn record_pipeline_outcome(route: &str, status: u16) {
    counter!(
        names::PIPELINE_OUTCOMES_TOTAL,
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Without an installed recorder these are no-ops; they must not panic.

    #[test]
    fn test_record_without_recorder() {
        record_auth_failure("expired");
        record_rate_limit_decision("admitted");
        record_store_error("counter", "timeout", "fail_open");
        record_cache_lookup("hit");
        record_pipeline_outcome("reports", 200);
    }

    #[test]
    fn test_breaker_metrics_without_recorder() {
        record_breaker_state("warehouse", CircuitState::Closed);
        record_breaker_transition("warehouse", CircuitState::Closed, CircuitState::Open);
        record_breaker_rejection("warehouse");
    }
}
