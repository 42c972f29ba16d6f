use super::AppState;
use crate::{
    auth::AuthUser,
    error::AppError,
    jobs::{JobInfo, JobKind, Priority},
    metrics,
};
use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde_json::{Value, json};
use uuid::Uuid;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sync", post(enqueue_sync))
        .route("/{id}", get(job_status))
}

/// Status of one of the caller's jobs.
///
/// - Method: `GET`
/// - Path: `/api/jobs/{id}`
///
/// Jobs owned by someone else, or by the scheduler, are reported as missing.
async fn job_status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, AppError> {
    metrics::inc_requests("/api/jobs/{id}");
    let id = Uuid::parse_str(&id).map_err(|_| AppError::bad_request("Invalid job id"))?;
    state
        .queue
        .get(id)
        .await
        .filter(|job| job.owner.as_deref() == Some(user.user_id.as_str()))
        .map(Json)
        .ok_or_else(|| AppError::not_found("Job not found"))
}

/// - Method: `POST`
/// - Path: `/api/jobs/sync`
/// - Response: `202` with `{ jobId }`
async fn enqueue_sync(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    metrics::inc_requests("/api/jobs/sync");
    let job = JobKind::SyncMarketplace {
        user_id: Some(user.user_id.clone()),
    };
    let id = state.queue.enqueue(job, Priority::Normal, Some(user.user_id)).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "jobId": id.to_string(), "status": "queued" })),
    ))
}
