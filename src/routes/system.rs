use super::AppState;
use crate::{error::AppError, metrics, security::keys_match};
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use chrono::Utc;
use serde_json::{Value, json};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
}

fn presented<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
///
/// `status` is `degraded` and the code 503 when the database does not answer.
async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    metrics::inc_requests("/health");
    let database = state.db.ping().await;
    let (status, label) = if database {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    (
        status,
        Json(json!({
            "status": label,
            "timestamp": Utc::now(),
            "uptime": state.started_at.elapsed().as_secs_f64(),
            "database": if database { "connected" } else { "disconnected" },
        })),
    )
}

/// Prometheus exposition, gated by `X-Metrics-Key` when `METRICS_KEY` is set.
async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = &state.config.metrics_key
        && !keys_match(presented(&headers, "x-metrics-key"), secret)
    {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus.render(),
    )
        .into_response()
}

async fn openapi_json(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>, AppError> {
    if let Some(key) = &state.config.openapi_key
        && !keys_match(presented(&headers, "x-docs-key"), key)
    {
        return Err(AppError::unauthorized("unauthorized"));
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> Html<&'static str> {
    Html(
        r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>SyncSellr API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#,
    )
}
