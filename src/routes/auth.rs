use super::AppState;
use crate::{
    auth::{self, AuthResponse, AuthUser, LoginRequest, RegisterRequest, TokenPair, require_user},
    error::AppError,
    metrics,
    models::UserProfile,
    security,
};
use axum::{
    Extension, Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    middleware,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};

pub fn routes(state: &AppState) -> Router<AppState> {
    let password_limited = Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route_layer(middleware::from_fn_with_state(
            state.limiters.password.clone(),
            security::rate_limit,
        ));
    let signed_in = Router::new()
        .route("/me", get(me))
        .route_layer(middleware::from_fn_with_state(state.tokens.clone(), require_user));

    Router::new()
        .route("/refresh", post(refresh))
        .route("/logout", post(logout))
        .merge(password_limited)
        .merge(signed_in)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshBody {
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Create an account.
///
/// - Method: `POST`
/// - Path: `/api/auth/register`
/// - Auth: none
/// - Response: `201` with the user and a token pair
async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AuthResponse>), AppError> {
    metrics::inc_requests("/api/auth/register");
    let Json(input) = payload?;
    let response = auth::register(&state.db, &state.hasher, &state.tokens, input).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// - Method: `POST`
/// - Path: `/api/auth/login`
/// - Auth: none
async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<AuthResponse>, AppError> {
    metrics::inc_requests("/api/auth/login");
    let Json(input) = payload?;
    Ok(Json(auth::login(&state.db, &state.hasher, &state.tokens, input).await?))
}

/// Rotate a refresh token.
///
/// - Method: `POST`
/// - Path: `/api/auth/refresh`
/// - Body: `{ refreshToken }`
async fn refresh(
    State(state): State<AppState>,
    payload: Result<Json<RefreshBody>, JsonRejection>,
) -> Result<Json<TokenPair>, AppError> {
    metrics::inc_requests("/api/auth/refresh");
    let Json(body) = payload?;
    let Some(token) = body.refresh_token else {
        return Err(AppError::bad_request("Refresh token required"));
    };
    Ok(Json(auth::refresh(&state.revocations, &state.tokens, &token).await?))
}

/// Always succeeds; a presented refresh token is revoked.
async fn logout(
    State(state): State<AppState>,
    payload: Result<Json<RefreshBody>, JsonRejection>,
) -> Json<Value> {
    metrics::inc_requests("/api/auth/logout");
    let body = payload.map(|Json(body)| body).unwrap_or_default();
    auth::logout(&state.revocations, body.refresh_token.as_deref()).await;
    Json(json!({ "success": true }))
}

async fn me(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<UserProfile>, AppError> {
    Ok(Json(auth::me(&state.db, &user.user_id).await?))
}

#[cfg(test)]
mod tests {
    use super::super::{router, tests::*};
    use crate::config::AppConfig;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn register_login_refresh_and_me() {
        let app = router(state().await);
        let access = signed_up(&app, "flow@example.com").await;

        let response = send(&app, get("/api/auth/me", Some(&access))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let me = json_body(response).await;
        assert_eq!(me["email"], "flow@example.com");
        assert_eq!(me["subscriptionTier"], "free");

        let response = send(
            &app,
            json_request(
                "POST",
                "/api/auth/login",
                None,
                json!({"email": "FLOW@example.com", "password": "Sideboard1"}),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let login = json_body(response).await;
        let refresh_token = login["refreshToken"].as_str().expect("refresh").to_string();

        let rotate = |token: String| {
            json_request("POST", "/api/auth/refresh", None, json!({"refreshToken": token}))
        };
        let response = send(&app, rotate(refresh_token.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let response = send(&app, rotate(refresh_token)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"], "Refresh token has been revoked");
    }

    #[tokio::test]
    async fn bad_credentials_are_401() {
        let app = router(state().await);
        signed_up(&app, "flow@example.com").await;
        let response = send(
            &app,
            json_request(
                "POST",
                "/api/auth/login",
                None,
                json!({"email": "flow@example.com", "password": "Wrongpass1"}),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"], "Invalid credentials");
    }

    #[tokio::test]
    async fn password_routes_have_their_own_limit() {
        let mut config = AppConfig::for_tests();
        config.rate_limits.password.max_requests = 1;
        let app = router(state_with(config).await);
        let attempt = || {
            json_request(
                "POST",
                "/api/auth/login",
                None,
                json!({"email": "nobody@example.com", "password": "Sideboard1"}),
            )
        };
        assert_eq!(send(&app, attempt()).await.status(), StatusCode::UNAUTHORIZED);
        let response = send(&app, attempt()).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            json_body(response).await["error"],
            "Too many attempts. Please try again in 15 minutes."
        );
    }
}
