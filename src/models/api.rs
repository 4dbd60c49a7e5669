use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::resilience::BreakerSnapshot;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "healthy", or "degraded" when the shared store is unreachable
    pub status: String,
    /// Which store backend is in use ("redis" or "memory")
    pub store: &'static str,
    /// Whether the store answered a ping
    pub store_reachable: bool,
    /// Service version
    pub version: String,
    /// Current timestamp
    pub timestamp: DateTime<Utc>,
}

/// The caller's verified identity, as returned by `GET /me`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub subject: String,
    pub roles: Vec<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Request to deliver a notification through the downstream notifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequest {
    /// Delivery channel (`email`, `sms` or `webhook`)
    pub channel: String,
    /// Channel-specific destination
    pub recipient: String,
    /// Message body
    pub message: String,
}

/// Response after the notifier accepted a notification.
#[derive(Debug, Serialize, Deserialize)]
pub struct NotificationAccepted {
    /// Locally assigned notification id
    pub id: Uuid,
    /// Reference returned by the downstream service
    pub delivery_ref: String,
    /// Subject that requested the delivery
    pub requested_by: String,
    pub accepted_at: DateTime<Utc>,
}

/// Statistics response for operators.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    /// Uptime in seconds
    pub uptime_seconds: u64,
    /// Rate limiter behaviour when the counter store fails
    pub rate_limit_failure_policy: String,
    /// Reads served by the primary report store (cache misses)
    pub report_fetches: u64,
    /// Notifications handed to the notifier
    pub notifications_sent: u64,
    /// One entry per dependency breaker, sorted by name
    pub breakers: Vec<BreakerSnapshot>,
}

/// Response after an operator force-closed a breaker.
#[derive(Debug, Serialize, Deserialize)]
pub struct BreakerClosedResponse {
    pub breaker: BreakerSnapshot,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_request_deserialization() {
        let json = r#"{"channel": "email", "recipient": "ops@example.com", "message": "disk full"}"#;
        let request: NotificationRequest =
            serde_json::from_str(json).expect("Deserialization should succeed");

        assert_eq!(request.channel, "email");
        assert_eq!(request.recipient, "ops@example.com");
    }

    #[test]
    fn test_notification_request_missing_field() {
        let json = r#"{"channel": "email"}"#;
        assert!(serde_json::from_str::<NotificationRequest>(json).is_err());
    }
}
