use axum::extract::{Path, State};
use tracing::instrument;

use crate::failure::{Failure, Outcome};
use crate::models::Report;
use crate::pipeline::RequestContext;
use crate::state::AppState;

/// `GET /reports/{id}`: read a report through the cache.
///
/// The id is parsed inside the pipeline so that unauthenticated callers get
/// 401 rather than a path error.
#[instrument(skip(state, context))]
pub async fn get_report(
    State(state): State<AppState>,
    Path(id): Path<String>,
    context: RequestContext,
) -> Outcome<Report> {
    let reports = state.reports.clone();

    state
        .pipeline
        .run(&state.policies.reports, context, move |_scope| async move {
            let id: u64 = id
                .parse()
                .map_err(|_| Failure::not_found(format!("Report {id} not found")))?;
            reports.fetch(id).await
        })
        .await
}
