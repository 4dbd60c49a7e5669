use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{NotificationAccepted, NotificationRequest};

/// A validated notification ready for delivery.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub id: Uuid,
    pub requested_by: String,
    pub channel: String,
    pub recipient: String,
    pub message: String,
}

impl Notification {
    pub fn new(requested_by: &str, request: NotificationRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            requested_by: requested_by.to_string(),
            channel: request.channel,
            recipient: request.recipient,
            message: request.message,
        }
    }
}

/// Downstream delivery service.
///
/// Errors are opaque: the caller only distinguishes "delivered" from "not
/// delivered", and the circuit breaker counts the latter.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver and return the downstream reference for the delivery.
    async fn deliver(&self, notification: &Notification) -> anyhow::Result<String>;
}

/// Posts notifications as JSON to an HTTP endpoint.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

#[derive(Deserialize)]
struct WebhookReceipt {
    id: Option<String>,
}

impl WebhookNotifier {
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("gatehouse/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AppError::ConfigError(format!("Failed to build notifier client: {e}")))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    #[instrument(skip(self, notification), fields(id = %notification.id, url = %self.url))]
    async fn deliver(&self, notification: &Notification) -> anyhow::Result<String> {
        let response = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .context("webhook request failed")?
            .error_for_status()
            .context("webhook rejected notification")?;

        // A receipt body is optional; fall back to our own id.
        let receipt = response
            .json::<WebhookReceipt>()
            .await
            .ok()
            .and_then(|r| r.id);

        Ok(receipt.unwrap_or_else(|| notification.id.to_string()))
    }
}

/// Writes notifications to the log. Used when no webhook is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, notification: &Notification) -> anyhow::Result<String> {
        info!(
            id = %notification.id,
            channel = %notification.channel,
            requested_by = %notification.requested_by,
            "Notification delivered to log"
        );
        Ok(format!("log:{}", notification.id))
    }
}

/// Sends notifications and counts successful deliveries.
///
/// The `sent` counter uses `Ordering::Relaxed`; it is informational only.
#[derive(Clone)]
pub struct NotificationService {
    notifier: Arc<dyn Notifier>,
    sent: Arc<AtomicU64>,
}

impl NotificationService {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            notifier,
            sent: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Deliver one notification.
    ///
    /// # Errors
    ///
    /// Propagates the notifier's error unchanged.
    pub async fn send(&self, notification: Notification) -> anyhow::Result<NotificationAccepted> {
        let delivery_ref = self.notifier.deliver(&notification).await?;
        self.sent.fetch_add(1, Ordering::Relaxed);

        Ok(NotificationAccepted {
            id: notification.id,
            delivery_ref,
            requested_by: notification.requested_by,
            accepted_at: Utc::now(),
        })
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}
