use crate::{db::Database, error::AppError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardingStatus {
    pub is_complete: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub cross_list_reminders: Map<String, Value>,
}

pub async fn onboarding(db: &Database, user_id: &str) -> Result<OnboardingStatus, AppError> {
    let user = db
        .find_user(user_id)
        .await?
        .ok_or_else(|| AppError::not_found("User not found"))?;
    Ok(OnboardingStatus {
        is_complete: user.onboarding_completed_at.is_some(),
        completed_at: user.onboarding_completed_at,
        cross_list_reminders: user.cross_list_reminders,
    })
}

pub async fn complete_onboarding(db: &Database, user_id: &str) -> Result<DateTime<Utc>, AppError> {
    let completed_at = db
        .complete_onboarding(user_id)
        .await?
        .ok_or_else(|| AppError::not_found("User not found"))?;
    info!(target = "syncsellr.users", user_id, "onboarding completed");
    Ok(completed_at)
}

/// Merges reminder flags into the stored map. Only a JSON object is accepted.
pub async fn update_reminders(
    db: &Database,
    user_id: &str,
    reminders: Option<Value>,
) -> Result<Map<String, Value>, AppError> {
    let Some(Value::Object(changes)) = reminders else {
        return Err(AppError::bad_request("crossListReminders must be an object"));
    };
    db.merge_reminders(user_id, changes)
        .await?
        .ok_or_else(|| AppError::not_found("User not found"))
}
