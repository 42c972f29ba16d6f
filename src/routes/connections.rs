use super::AppState;
use crate::{
    auth::AuthUser,
    connections::{self, display_name, parse_marketplace},
    error::AppError,
    marketplace::MarketplaceAdapter,
    metrics,
    models::{Marketplace, MarketplaceConnection},
};
use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list))
        .route("/{marketplace}/connect", post(connect))
        .route("/{marketplace}", delete(disconnect))
        .route("/ebay/auth-url", get(ebay_auth_url))
        .route("/ebay/callback", get(ebay_callback))
        .route("/etsy/auth-url", get(etsy_auth_url))
        .route("/etsy/callback", get(etsy_callback))
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
}

async fn adapter_for(
    state: &AppState,
    marketplace: Marketplace,
    user_id: &str,
) -> Result<Arc<dyn MarketplaceAdapter>, AppError> {
    state
        .marketplaces
        .get_for_user(marketplace, user_id)
        .await
        .ok_or_else(|| {
            AppError::bad_request(format!("{} integration is not configured", display_name(marketplace)))
        })
}

async fn auth_url(state: &AppState, marketplace: Marketplace, user_id: &str) -> Result<Json<Value>, AppError> {
    let url = adapter_for(state, marketplace, user_id).await?.auth_url().await?;
    Ok(Json(json!({ "url": url })))
}

async fn callback(
    state: &AppState,
    marketplace: Marketplace,
    user_id: &str,
    params: CallbackParams,
) -> Result<Json<Value>, AppError> {
    let (Some(code), Some(oauth_state)) = (
        params.code.filter(|c| !c.is_empty()),
        params.state.filter(|s| !s.is_empty()),
    ) else {
        return Err(AppError::bad_request("Missing code or state parameter"));
    };
    adapter_for(state, marketplace, user_id)
        .await?
        .handle_callback(&code, &oauth_state)
        .await?;
    Ok(Json(json!({ "success": true })))
}

/// - Method: `GET`
/// - Path: `/api/connections`
async fn list(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<MarketplaceConnection>>, AppError> {
    metrics::inc_requests("/api/connections");
    Ok(Json(state.db.list_connections(&user.user_id).await?))
}

/// Marks a browser-automated marketplace as connected.
///
/// - Method: `POST`
/// - Path: `/api/connections/{marketplace}/connect`
async fn connect(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(marketplace): Path<String>,
) -> Result<Json<MarketplaceConnection>, AppError> {
    metrics::inc_requests("/api/connections:connect");
    let marketplace = parse_marketplace(&marketplace)?;
    Ok(Json(connections::connect(&state.db, &user.user_id, marketplace).await?))
}

async fn disconnect(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(marketplace): Path<String>,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/api/connections:disconnect");
    let marketplace = parse_marketplace(&marketplace)?;
    connections::disconnect(&state.db, &user.user_id, marketplace).await?;
    Ok(Json(json!({ "success": true })))
}

/// - Method: `GET`
/// - Path: `/api/connections/ebay/auth-url`
/// - Response: `{ url }` to send the user to
async fn ebay_auth_url(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/api/connections/ebay/auth-url");
    auth_url(&state, Marketplace::Ebay, &user.user_id).await
}

/// - Method: `GET`
/// - Path: `/api/connections/ebay/callback?code&state`
async fn ebay_callback(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(params): Query<CallbackParams>,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/api/connections/ebay/callback");
    callback(&state, Marketplace::Ebay, &user.user_id, params).await
}

async fn etsy_auth_url(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/api/connections/etsy/auth-url");
    auth_url(&state, Marketplace::Etsy, &user.user_id).await
}

async fn etsy_callback(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(params): Query<CallbackParams>,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/api/connections/etsy/callback");
    callback(&state, Marketplace::Etsy, &user.user_id, params).await
}
