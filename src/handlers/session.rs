use axum::extract::State;
use tracing::instrument;

use crate::failure::{Failure, Outcome};
use crate::models::SessionResponse;
use crate::pipeline::RequestContext;
use crate::state::AppState;

/// `GET /me`: echo the verified identity.
#[instrument(skip_all)]
pub async fn me(State(state): State<AppState>, context: RequestContext) -> Outcome<SessionResponse> {
    state
        .pipeline
        .run(&state.policies.me, context, |scope| async move {
            let identity = scope
                .identity
                .ok_or_else(|| Failure::internal("authenticated route ran without an identity"))?;

            Ok(SessionResponse {
                subject: identity.subject().to_string(),
                roles: identity.roles().iter().cloned().collect(),
                issued_at: identity.issued_at(),
                expires_at: identity.expires_at(),
            })
        })
        .await
}
