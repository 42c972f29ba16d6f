use crate::{
    db::Database,
    error::AppError,
    marketplace::{MarketplaceError, oauth::TokenResponse},
    models::{ConnectionStatus, Marketplace, MarketplaceConnection, OAuthState},
};
use chrono::{Duration, Utc};
use std::future::Future;
use tracing::{info, warn};

pub const OAUTH_STATE_TTL: Duration = Duration::minutes(10);
/// Tokens closer than this to expiry are refreshed before use.
pub const TOKEN_REFRESH_BUFFER: Duration = Duration::minutes(5);

pub fn display_name(marketplace: Marketplace) -> &'static str {
    match marketplace {
        Marketplace::Ebay => "eBay",
        Marketplace::Etsy => "Etsy",
        Marketplace::Facebook => "Facebook",
        Marketplace::Gumtree => "Gumtree",
        Marketplace::Vinted => "Vinted",
        Marketplace::Depop => "Depop",
        Marketplace::Poshmark => "Poshmark",
    }
}

pub fn parse_marketplace(raw: &str) -> Result<Marketplace, AppError> {
    raw.parse()
        .map_err(|_| AppError::bad_request("Invalid marketplace"))
}

/// Browser-automated marketplaces are "connected" once the user says so.
pub async fn connect(
    db: &Database,
    user_id: &str,
    marketplace: Marketplace,
) -> Result<MarketplaceConnection, AppError> {
    let connection = db
        .upsert_connection_status(user_id, marketplace, ConnectionStatus::Connected)
        .await?;
    info!(target = "syncsellr.connections", user_id, %marketplace, "marketplace connected");
    Ok(connection)
}

pub async fn disconnect(db: &Database, user_id: &str, marketplace: Marketplace) -> Result<(), AppError> {
    if !db.delete_connection(user_id, marketplace).await? {
        return Err(AppError::not_found("Connection not found"));
    }
    info!(target = "syncsellr.connections", user_id, %marketplace, "marketplace disconnected");
    Ok(())
}

/// Records a fresh OAuth state for `user_id` and returns it.
pub async fn begin_oauth(
    db: &Database,
    user_id: &str,
    marketplace: Marketplace,
    code_verifier: Option<String>,
) -> Result<String, AppError> {
    let state = crate::marketplace::oauth::generate_state();
    db.create_oauth_state(&OAuthState {
        state: state.clone(),
        user_id: user_id.to_string(),
        marketplace,
        code_verifier,
        expires_at: Utc::now() + OAUTH_STATE_TTL,
    })
    .await?;
    Ok(state)
}

/// Validates a callback's state. Expired states are deleted on the way out.
pub async fn claim_oauth_state(
    db: &Database,
    state: &str,
    user_id: &str,
    marketplace: Marketplace,
) -> Result<OAuthState, AppError> {
    let stored = db
        .find_oauth_state(state)
        .await?
        .filter(|s| s.user_id == user_id && s.marketplace == marketplace)
        .ok_or_else(|| AppError::bad_request("Invalid OAuth state"))?;
    if stored.is_expired(Utc::now()) {
        db.delete_oauth_state(&stored.state).await?;
        return Err(AppError::bad_request("OAuth state expired"));
    }
    Ok(stored)
}

/// Finishes the code exchange. The state is consumed whether or not the exchange worked,
/// so a failed attempt can be retried from scratch.
pub async fn complete_oauth<Fut>(
    db: &Database,
    state: &OAuthState,
    exchange: Fut,
) -> Result<MarketplaceConnection, AppError>
where
    Fut: Future<Output = Result<TokenResponse, MarketplaceError>>,
{
    let name = display_name(state.marketplace);
    let tokens = match exchange.await {
        Ok(tokens) => tokens,
        Err(err) => {
            warn!(
                target = "syncsellr.connections",
                marketplace = %state.marketplace,
                error = %err,
                "authorization code exchange failed"
            );
            if let Err(cleanup) = db.delete_oauth_state(&state.state).await {
                warn!(target = "syncsellr.connections", error = %cleanup, "oauth state cleanup failed");
            }
            return Err(AppError::BadGateway(format!(
                "Failed to exchange {name} authorization code for tokens"
            )));
        }
    };
    db.delete_oauth_state(&state.state).await?;
    let connection = db
        .store_tokens(&state.user_id, state.marketplace, &tokens.into_stored())
        .await?;
    info!(
        target = "syncsellr.connections",
        user_id = %state.user_id,
        marketplace = %state.marketplace,
        "oauth completed"
    );
    Ok(connection)
}

/// A usable access token for the user's connection, refreshing it through
/// `refresh` when it is about to expire.
pub async fn access_token<F, Fut>(
    db: &Database,
    user_id: &str,
    marketplace: Marketplace,
    refresh: F,
) -> Result<String, AppError>
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Result<TokenResponse, MarketplaceError>>,
{
    let name = display_name(marketplace);
    let connection = db.find_connection(user_id, marketplace).await?;
    let Some((connection, access)) = connection.and_then(|c| {
        let access = c.access_token.clone()?;
        Some((c, access))
    }) else {
        return Err(AppError::unauthorized(format!("{name} not connected")));
    };

    let needs_refresh = connection
        .token_expires_at
        .is_some_and(|at| at - Utc::now() < TOKEN_REFRESH_BUFFER);
    if !needs_refresh {
        return Ok(access);
    }

    let Some(refresh_token) = connection.refresh_token.clone() else {
        db.set_connection_status(&connection.id, ConnectionStatus::Disconnected)
            .await?;
        return Err(AppError::unauthorized(format!(
            "{name} token expired and no refresh token available. Please reconnect."
        )));
    };

    match refresh(refresh_token).await {
        Ok(tokens) => {
            let updated = db
                .store_tokens(user_id, marketplace, &tokens.into_stored())
                .await?;
            info!(target = "syncsellr.connections", user_id, %marketplace, "access token refreshed");
            updated
                .access_token
                .ok_or_else(|| AppError::internal("refreshed connection lost its access token"))
        }
        Err(err) => {
            warn!(
                target = "syncsellr.connections",
                user_id,
                %marketplace,
                error = %err,
                "token refresh failed"
            );
            if let Err(mark) = db
                .set_connection_status(&connection.id, ConnectionStatus::Disconnected)
                .await
            {
                warn!(target = "syncsellr.connections", error = %mark, "could not mark connection disconnected");
            }
            Err(AppError::unauthorized(format!(
                "{name} token refresh failed. Please reconnect your {name} account."
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{
        StoredTokens,
        test_support::{database, user},
    };
    use axum::http::StatusCode;

    fn tokens(access: &str, expires_in: i64) -> TokenResponse {
        TokenResponse {
            access_token: access.into(),
            refresh_token: Some(format!("{access}-refresh")),
            expires_in,
        }
    }

    async fn never_refresh(_: String) -> Result<TokenResponse, MarketplaceError> {
        panic!("refresh should not be called")
    }

    #[test]
    fn unknown_marketplace_is_rejected() {
        assert_eq!(parse_marketplace("vinted").expect("known"), Marketplace::Vinted);
        let err = parse_marketplace("craigslist").expect_err("unknown");
        assert_eq!(err.to_string(), "Invalid marketplace");
    }

    #[tokio::test]
    async fn disconnect_without_connection_is_not_found() {
        let db = database().await;
        let owner = user(&db, "seller@example.com").await;
        let err = disconnect(&db, &owner.id, Marketplace::Depop)
            .await
            .expect_err("missing");
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        connect(&db, &owner.id, Marketplace::Depop).await.expect("connect");
        disconnect(&db, &owner.id, Marketplace::Depop).await.expect("disconnect");
    }

    #[tokio::test]
    async fn oauth_state_is_bound_to_user_and_platform() {
        let db = database().await;
        let owner = user(&db, "seller@example.com").await;
        let other = user(&db, "other@example.com").await;
        let state = begin_oauth(&db, &owner.id, Marketplace::Ebay, None)
            .await
            .expect("state");

        let err = claim_oauth_state(&db, &state, &other.id, Marketplace::Ebay)
            .await
            .expect_err("wrong user");
        assert_eq!(err.to_string(), "Invalid OAuth state");
        let err = claim_oauth_state(&db, &state, &owner.id, Marketplace::Etsy)
            .await
            .expect_err("wrong platform");
        assert_eq!(err.to_string(), "Invalid OAuth state");
        claim_oauth_state(&db, &state, &owner.id, Marketplace::Ebay)
            .await
            .expect("valid");
    }

    #[tokio::test]
    async fn expired_state_is_deleted() {
        let db = database().await;
        let owner = user(&db, "seller@example.com").await;
        db.create_oauth_state(&OAuthState {
            state: "stale".into(),
            user_id: owner.id.clone(),
            marketplace: Marketplace::Etsy,
            code_verifier: Some("v".into()),
            expires_at: Utc::now() - Duration::minutes(1),
        })
        .await
        .expect("insert");
        let err = claim_oauth_state(&db, "stale", &owner.id, Marketplace::Etsy)
            .await
            .expect_err("expired");
        assert_eq!(err.to_string(), "OAuth state expired");
        assert!(db.find_oauth_state("stale").await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn failed_exchange_consumes_state_and_reports_bad_gateway() {
        let db = database().await;
        let owner = user(&db, "seller@example.com").await;
        let state = begin_oauth(&db, &owner.id, Marketplace::Etsy, Some("verifier".into()))
            .await
            .expect("state");
        let claimed = claim_oauth_state(&db, &state, &owner.id, Marketplace::Etsy)
            .await
            .expect("claim");
        let err = complete_oauth(&db, &claimed, async {
            Err(MarketplaceError::Status {
                marketplace: "etsy",
                status: 400,
            })
        })
        .await
        .expect_err("exchange failed");
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(err.to_string(), "Failed to exchange Etsy authorization code for tokens");
        assert!(db.find_oauth_state(&state).await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn successful_exchange_stores_tokens() {
        let db = database().await;
        let owner = user(&db, "seller@example.com").await;
        let state = begin_oauth(&db, &owner.id, Marketplace::Ebay, None)
            .await
            .expect("state");
        let claimed = claim_oauth_state(&db, &state, &owner.id, Marketplace::Ebay)
            .await
            .expect("claim");
        let connection = complete_oauth(&db, &claimed, async { Ok(tokens("fresh", 7200)) })
            .await
            .expect("complete");
        assert_eq!(connection.status, ConnectionStatus::Connected);
        assert_eq!(connection.access_token.as_deref(), Some("fresh"));
        let token = access_token(&db, &owner.id, Marketplace::Ebay, never_refresh)
            .await
            .expect("token");
        assert_eq!(token, "fresh");
    }

    #[tokio::test]
    async fn missing_connection_is_unauthorized() {
        let db = database().await;
        let owner = user(&db, "seller@example.com").await;
        let err = access_token(&db, &owner.id, Marketplace::Ebay, never_refresh)
            .await
            .expect_err("not connected");
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.to_string(), "eBay not connected");
    }

    #[tokio::test]
    async fn near_expiry_token_is_refreshed() {
        let db = database().await;
        let owner = user(&db, "seller@example.com").await;
        db.store_tokens(
            &owner.id,
            Marketplace::Etsy,
            &StoredTokens {
                access_token: "old".into(),
                refresh_token: Some("rt".into()),
                expires_at: Utc::now() + Duration::minutes(2),
            },
        )
        .await
        .expect("store");
        let token = access_token(&db, &owner.id, Marketplace::Etsy, |rt| async move {
            assert_eq!(rt, "rt");
            Ok(TokenResponse {
                access_token: "new".into(),
                refresh_token: None,
                expires_in: 3600,
            })
        })
        .await
        .expect("refreshed");
        assert_eq!(token, "new");
        let stored = db
            .find_connection(&owner.id, Marketplace::Etsy)
            .await
            .expect("lookup")
            .expect("connection");
        assert_eq!(stored.refresh_token.as_deref(), Some("rt"));
    }

    #[tokio::test]
    async fn refresh_failure_disconnects() {
        let db = database().await;
        let owner = user(&db, "seller@example.com").await;
        db.store_tokens(
            &owner.id,
            Marketplace::Ebay,
            &StoredTokens {
                access_token: "old".into(),
                refresh_token: Some("rt".into()),
                expires_at: Utc::now() - Duration::minutes(1),
            },
        )
        .await
        .expect("store");
        let err = access_token(&db, &owner.id, Marketplace::Ebay, |_| async {
            Err(MarketplaceError::Request("connection reset".into()))
        })
        .await
        .expect_err("refresh failed");
        assert_eq!(
            err.to_string(),
            "eBay token refresh failed. Please reconnect your eBay account."
        );
        let stored = db
            .find_connection(&owner.id, Marketplace::Ebay)
            .await
            .expect("lookup")
            .expect("connection");
        assert_eq!(stored.status, ConnectionStatus::Disconnected);
    }
}
