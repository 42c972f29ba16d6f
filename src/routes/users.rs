use super::AppState;
use crate::{
    auth::AuthUser,
    error::AppError,
    metrics,
    users::{self, OnboardingStatus},
};
use axum::{
    Extension, Json, Router,
    extract::{State, rejection::JsonRejection},
    routing::{get, patch, post},
};
use serde::Deserialize;
use serde_json::{Value, json};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/onboarding", get(onboarding))
        .route("/onboarding/complete", post(complete_onboarding))
        .route("/preferences", patch(update_preferences))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreferencesBody {
    #[serde(default)]
    cross_list_reminders: Option<Value>,
}

async fn onboarding(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<OnboardingStatus>, AppError> {
    metrics::inc_requests("/api/users/onboarding");
    Ok(Json(users::onboarding(&state.db, &user.user_id).await?))
}

async fn complete_onboarding(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/api/users/onboarding/complete");
    let completed_at = users::complete_onboarding(&state.db, &user.user_id).await?;
    Ok(Json(json!({ "success": true, "completedAt": completed_at })))
}

/// - Method: `PATCH`
/// - Path: `/api/users/preferences`
/// - Body: `{ crossListReminders: { <marketplace>: bool } }`
async fn update_preferences(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    payload: Result<Json<PreferencesBody>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/api/users/preferences");
    let Json(body) = payload?;
    let reminders = users::update_reminders(&state.db, &user.user_id, body.cross_list_reminders).await?;
    Ok(Json(json!({ "success": true, "crossListReminders": reminders })))
}
