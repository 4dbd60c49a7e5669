use axum::body::Bytes;
use axum::extract::State;
use tracing::{info, instrument};

use crate::failure::{Failure, Outcome};
use crate::models::{NotificationAccepted, NotificationRequest};
use crate::pipeline::RequestContext;
use crate::services::Notification;
use crate::state::AppState;
use crate::validation::validate_notification;

/// `POST /notifications`: deliver through the notifier behind its breaker.
///
/// The body is decoded and validated inside the pipeline, after the caller
/// is authorized. Validation failures are client errors and do not count
/// against the notifier's breaker.
#[instrument(skip_all)]
pub async fn send_notification(
    State(state): State<AppState>,
    context: RequestContext,
    body: Bytes,
) -> Outcome<NotificationAccepted> {
    let notifications = state.notifications.clone();

    state
        .pipeline
        .run(&state.policies.notifications, context, move |scope| async move {
            let request: NotificationRequest = serde_json::from_slice(&body)
                .map_err(|e| Failure::validation(vec![format!("invalid JSON body: {e}")]))?;
            validate_notification(&request)?;

            let subject = scope
                .identity
                .as_ref()
                .map_or("anonymous", |identity| identity.subject());
            let notification = Notification::new(subject, request);

            let accepted = notifications
                .send(notification)
                .await
                .map_err(|e| Failure::dependency_error("Notifier", format!("{e:#}")))?;

            info!(id = %accepted.id, requested_by = %accepted.requested_by, "Notification accepted");
            Ok(accepted)
        })
        .await
}
