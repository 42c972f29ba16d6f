use super::AppState;
use crate::{
    auth::require_user,
    error::AppError,
    metrics,
    selectors::{
        HealthCheckResult, MAX_SNAPSHOT_BYTES, SNAPSHOT_BODY_LIMIT, SelectorError, StaticPage,
        generate_probe_script,
    },
};
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, Query, State, rejection::JsonRejection},
    handler::Handler,
    http::{StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

/// Remote configs older than this are reported as stale.
const STALE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

pub fn routes(state: &AppState) -> Router<AppState> {
    let signed_in = middleware::from_fn_with_state(state.tokens.clone(), require_user);
    Router::new()
        .route("/selectors", get(selectors))
        .route(
            "/selectors/health",
            get(latest_health).post(
                check_snapshot
                    .layer(signed_in)
                    .layer(DefaultBodyLimit::max(SNAPSHOT_BODY_LIMIT)),
            ),
        )
        .route("/selectors/{platform}/probe.js", get(probe_script))
}

#[derive(Debug, Deserialize)]
struct VersionQuery {
    v: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SnapshotRequest {
    platform: String,
    html: String,
}

/// Current selector config for the extension.
///
/// - Method: `GET`
/// - Path: `/api/config/selectors?v=<version>`
/// - Auth: none
///
/// Answers `304` with no body when the caller already holds `version`.
async fn selectors(State(state): State<AppState>, Query(query): Query<VersionQuery>) -> Response {
    metrics::inc_requests("/api/config/selectors");
    let version = state.selectors.version().await;
    if query.v.as_deref() == Some(version.as_str()) {
        return StatusCode::NOT_MODIFIED.into_response();
    }
    Json(state.selectors.config().await).into_response()
}

async fn latest_health(State(state): State<AppState>) -> Json<Value> {
    metrics::inc_requests("/api/config/selectors/health");
    Json(json!({
        "version": state.selectors.version().await,
        "lastUpdated": state.selectors.last_updated().await,
        "stale": state.selectors.is_stale(STALE_AFTER).await,
        "results": state.prober.latest().await,
    }))
}

/// Checks a page snapshot sent by the extension and records the outcome.
///
/// - Method: `POST`
/// - Path: `/api/config/selectors/health`
/// - Auth: bearer
async fn check_snapshot(
    State(state): State<AppState>,
    payload: Result<Json<SnapshotRequest>, JsonRejection>,
) -> Result<Json<HealthCheckResult>, AppError> {
    metrics::inc_requests("/api/config/selectors/health:check");
    let Json(request) = payload?;
    let platform = request.platform.trim().to_lowercase();
    if platform.is_empty() {
        return Err(AppError::bad_request("platform is required"));
    }
    if request.html.len() > MAX_SNAPSHOT_BYTES {
        return Err(AppError::PayloadTooLarge);
    }
    let page = StaticPage(request.html);
    state
        .prober
        .probe_page(&platform, &page)
        .await
        .map(Json)
        .ok_or_else(|| AppError::internal("static snapshot unreadable"))
}

async fn probe_script(State(state): State<AppState>, Path(platform): Path<String>) -> Result<Response, AppError> {
    let config = state.selectors.config().await;
    match generate_probe_script(&config, &platform) {
        Ok(script) => Ok((
            [(header::CONTENT_TYPE, "application/javascript; charset=utf-8")],
            script,
        )
            .into_response()),
        Err(SelectorError::UnknownPlatform(platform)) => {
            Err(AppError::not_found(format!("No selector config for platform: {platform}")))
        }
        Err(err) => Err(AppError::internal(err.to_string())),
    }
}
