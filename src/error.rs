use crate::{circuit_breaker::CircuitOpen, marketplace::MarketplaceError};
use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_with::skip_serializing_none;
use thiserror::Error;
use tracing::{error, warn};

/// Wire shape of every error the API returns.
#[skip_serializing_none]
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub error: String,
    pub status_code: u16,
    pub details: Option<Vec<FieldError>>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation failed")]
    Validation(Vec<FieldError>),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    TooManyRequests(String),
    #[error("Request body too large")]
    PayloadTooLarge,
    #[error("{0}")]
    BadGateway(String),
    #[error("{0}")]
    Unavailable(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Marketplace(#[from] MarketplaceError),
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    #[cfg(test)]
    pub fn status(&self) -> StatusCode {
        self.parts().0
    }

    fn parts(&self) -> (StatusCode, String) {
        match self {
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::TooManyRequests(msg) => (StatusCode::TOO_MANY_REQUESTS, msg.clone()),
            AppError::PayloadTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, self.to_string()),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::Database(err) => database_parts(err),
            AppError::Marketplace(err) => marketplace_parts(err),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        }
    }
}

fn database_parts(err: &sqlx::Error) -> (StatusCode, String) {
    match err {
        sqlx::Error::RowNotFound => (StatusCode::NOT_FOUND, "Record not found".to_string()),
        sqlx::Error::Database(db) if db.is_unique_violation() => (
            StatusCode::CONFLICT,
            "A record with this value already exists".to_string(),
        ),
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => (
            StatusCode::BAD_REQUEST,
            "Related record not found".to_string(),
        ),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Database operation failed".to_string(),
        ),
    }
}

fn marketplace_parts(err: &MarketplaceError) -> (StatusCode, String) {
    match err {
        MarketplaceError::Status { status, .. } if *status == 401 || *status == 403 => (
            StatusCode::BAD_GATEWAY,
            "Marketplace authentication failed".to_string(),
        ),
        MarketplaceError::Status { status: 429, .. } => (
            StatusCode::TOO_MANY_REQUESTS,
            "Marketplace rate limit exceeded. Please try again later.".to_string(),
        ),
        MarketplaceError::Status { .. } | MarketplaceError::Request(_) => (
            StatusCode::BAD_GATEWAY,
            "External service request failed".to_string(),
        ),
        MarketplaceError::NotConfigured(msg) | MarketplaceError::Rejected(msg) => {
            (StatusCode::BAD_REQUEST, msg.clone())
        }
        MarketplaceError::CircuitOpen(open) => {
            (StatusCode::SERVICE_UNAVAILABLE, open.to_string())
        }
    }
}

impl From<CircuitOpen> for AppError {
    fn from(value: CircuitOpen) -> Self {
        AppError::Marketplace(MarketplaceError::CircuitOpen(value))
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        match rejection {
            JsonRejection::JsonDataError(err) => {
                AppError::Validation(vec![FieldError::new("body", err.body_text())])
            }
            JsonRejection::MissingJsonContentType(_) => {
                AppError::bad_request("Expected request with `Content-Type: application/json`")
            }
            _ => AppError::bad_request("Invalid JSON in request body"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = self.parts();
        match &self {
            AppError::Database(err) => {
                error!(target = "syncsellr.api", error = %err, "database error")
            }
            AppError::Marketplace(err) => {
                warn!(target = "syncsellr.api", error = %err, "marketplace error")
            }
            AppError::Internal(detail) => {
                error!(target = "syncsellr.api", detail = %detail, "internal error")
            }
            _ => {}
        }
        let details = match self {
            AppError::Validation(fields) => Some(fields),
            _ => None,
        };
        let payload = ApiError {
            error: message,
            status_code: status.as_u16(),
            details,
        };
        (status, Json(payload)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(err: AppError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, serde_json::from_slice(&bytes).expect("json"))
    }

    #[tokio::test]
    async fn validation_error_carries_field_details() {
        let (status, body) = body_json(AppError::Validation(vec![FieldError::new(
            "title",
            "Must be at least 5 characters",
        )]))
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Validation failed");
        assert_eq!(body["statusCode"], 400);
        assert_eq!(body["details"][0]["field"], "title");
    }

    #[tokio::test]
    async fn row_not_found_maps_to_404() {
        let (status, body) = body_json(AppError::Database(sqlx::Error::RowNotFound)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Record not found");
        assert!(body.get("details").is_none());
    }

    #[tokio::test]
    async fn upstream_auth_failure_maps_to_bad_gateway() {
        let err = AppError::Marketplace(MarketplaceError::Status {
            marketplace: "ebay",
            status: 403,
        });
        let (status, body) = body_json(err).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"], "Marketplace authentication failed");
    }

    #[tokio::test]
    async fn upstream_rate_limit_passes_through() {
        let err = AppError::Marketplace(MarketplaceError::Status {
            marketplace: "etsy",
            status: 429,
        });
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn internal_detail_is_not_leaked() {
        let (status, body) = body_json(AppError::internal("disk on fire")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Internal server error");
    }
}
