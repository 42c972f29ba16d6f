//! Accounts, password login and rotating JWT sessions.

pub mod jwt;
pub mod password;
pub mod revocation;

pub use jwt::{TokenIssuer, TokenPair};
pub use password::PasswordHasher;
pub use revocation::RevocationList;

use crate::{db::Database, error::AppError, models::UserProfile};
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap_or_else(|err| panic!("email pattern: {err}"))
});

/// The authenticated caller, inserted by [`require_user`].
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub user: UserProfile,
    #[serde(flatten)]
    pub tokens: TokenPair,
}

/// Validated registration input.
#[derive(Debug, PartialEq, Eq)]
pub struct NewAccount {
    pub email: String,
    pub password: String,
    pub name: String,
}

fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

fn email_problems(email: &str, problems: &mut Vec<&'static str>) {
    if !EMAIL.is_match(email) {
        problems.push("Invalid email address");
    }
    if email.chars().count() > 255 {
        problems.push("Email too long");
    }
}

/// Collects every rule the input breaks, in field order.
pub fn validate_registration(input: RegisterRequest) -> Result<NewAccount, AppError> {
    let email = normalize_email(&input.email);
    let name = input.name.trim().to_string();
    let mut problems = Vec::new();

    email_problems(&email, &mut problems);
    let password_len = input.password.chars().count();
    if password_len < 8 {
        problems.push("Password must be at least 8 characters");
    }
    if password_len > 128 {
        problems.push("Password too long");
    }
    let has_lower = input.password.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = input.password.chars().any(|c| c.is_ascii_uppercase());
    let has_digit = input.password.chars().any(|c| c.is_ascii_digit());
    if !(has_lower && has_upper && has_digit) {
        problems.push(
            "Password must contain at least one uppercase letter, one lowercase letter, and one number",
        );
    }
    if name.is_empty() {
        problems.push("Name is required");
    }
    if name.chars().count() > 100 {
        problems.push("Name too long");
    }

    if problems.is_empty() {
        Ok(NewAccount {
            email,
            password: input.password,
            name,
        })
    } else {
        Err(AppError::bad_request(problems.join(", ")))
    }
}

fn validate_login(input: LoginRequest) -> Result<LoginRequest, AppError> {
    let email = normalize_email(&input.email);
    let mut problems = Vec::new();
    email_problems(&email, &mut problems);
    if input.password.is_empty() {
        problems.push("Password is required");
    }
    if input.password.chars().count() > 128 {
        problems.push("Password too long");
    }
    if problems.is_empty() {
        Ok(LoginRequest {
            email,
            password: input.password,
        })
    } else {
        Err(AppError::bad_request(problems.join(", ")))
    }
}

fn issue(tokens: &TokenIssuer, user_id: &str) -> Result<TokenPair, AppError> {
    tokens
        .issue(user_id)
        .map_err(|err| AppError::internal(format!("token issue: {err}")))
}

pub async fn register(
    db: &Database,
    hasher: &PasswordHasher,
    tokens: &TokenIssuer,
    input: RegisterRequest,
) -> Result<AuthResponse, AppError> {
    let account = validate_registration(input)?;
    if db.find_user_by_email(&account.email).await?.is_some() {
        return Err(AppError::bad_request("Email already registered"));
    }
    let hash = hasher.hash(&account.password).await?;
    let user = match db.create_user(&account.email, &hash, &account.name).await {
        Ok(user) => user,
        Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
            return Err(AppError::bad_request("Email already registered"));
        }
        Err(err) => return Err(err.into()),
    };
    info!(target = "syncsellr.auth", user_id = %user.id, "account registered");
    Ok(AuthResponse {
        user: user.summary(),
        tokens: issue(tokens, &user.id)?,
    })
}

pub async fn login(
    db: &Database,
    hasher: &PasswordHasher,
    tokens: &TokenIssuer,
    input: LoginRequest,
) -> Result<AuthResponse, AppError> {
    let input = validate_login(input)?;
    let Some(user) = db.find_user_by_email(&input.email).await? else {
        hasher.verify_dummy(&input.password).await?;
        debug!(target = "syncsellr.auth", "login for unknown account");
        return Err(AppError::unauthorized("Invalid credentials"));
    };
    if !hasher.verify(&input.password, &user.password_hash).await? {
        warn!(target = "syncsellr.auth", user_id = %user.id, "password mismatch");
        return Err(AppError::unauthorized("Invalid credentials"));
    }
    info!(target = "syncsellr.auth", user_id = %user.id, "login succeeded");
    Ok(AuthResponse {
        user: user.summary(),
        tokens: issue(tokens, &user.id)?,
    })
}

/// Rotates a refresh token: the presented one is revoked and a new pair issued.
pub async fn refresh(
    revocations: &RevocationList,
    tokens: &TokenIssuer,
    refresh_token: &str,
) -> Result<TokenPair, AppError> {
    if refresh_token.is_empty() || refresh_token.len() > jwt::MAX_TOKEN_LEN {
        return Err(AppError::unauthorized("Invalid refresh token"));
    }
    if revocations.is_revoked(refresh_token).await {
        warn!(target = "syncsellr.auth", "revoked refresh token presented");
        return Err(AppError::unauthorized("Refresh token has been revoked"));
    }
    let claims = tokens.verify_refresh(refresh_token).map_err(|err| {
        debug!(target = "syncsellr.auth", error = %err, "refresh token rejected");
        AppError::unauthorized("Invalid refresh token")
    })?;
    if !revocations.revoke_if_absent(refresh_token).await {
        warn!(target = "syncsellr.auth", "refresh token rotated concurrently");
        return Err(AppError::unauthorized("Refresh token has been revoked"));
    }
    issue(tokens, &claims.user_id)
}

pub async fn logout(revocations: &RevocationList, refresh_token: Option<&str>) {
    if let Some(token) = refresh_token.filter(|t| !t.is_empty()) {
        revocations.revoke(token).await;
    }
}

pub async fn me(db: &Database, user_id: &str) -> Result<UserProfile, AppError> {
    db.find_user(user_id)
        .await?
        .map(|user| user.profile())
        .ok_or_else(|| AppError::not_found("User not found"))
}

/// Rejects requests without a valid access token and records the caller.
pub async fn require_user(
    State(tokens): State<TokenIssuer>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(token) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
    else {
        return Err(AppError::unauthorized("Authentication required"));
    };
    if token.is_empty() || token.len() > jwt::MAX_TOKEN_LEN {
        return Err(AppError::unauthorized("Invalid token format"));
    }
    let claims = tokens.verify_access(token).map_err(|err| {
        debug!(target = "syncsellr.auth", error = %err, "access token rejected");
        AppError::unauthorized("Invalid or expired token")
    })?;
    request.extensions_mut().insert(AuthUser {
        user_id: claims.user_id,
    });
    Ok(next.run(request).await)
}
