use crate::{
    config::MarketplaceCredentials,
    marketplace::{
        MarketplaceError,
        oauth::{PkcePair, TokenResponse, request_token},
    },
};
use reqwest::Client;

pub const AUTHORIZE_URL: &str = "https://www.etsy.com/oauth/connect";
pub const TOKEN_URL: &str = "https://api.etsy.com/v3/public/oauth/token";
pub const SCOPE: &str = "listings_r listings_w transactions_r";

pub fn authorize_url(credentials: &MarketplaceCredentials, state: &str, pkce: &PkcePair) -> String {
    let mut url = url::Url::parse(AUTHORIZE_URL).expect("static Etsy authorize URL");
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", &credentials.client_id)
        .append_pair("redirect_uri", &credentials.redirect_uri)
        .append_pair("scope", SCOPE)
        .append_pair("state", state)
        .append_pair("code_challenge", &pkce.challenge)
        .append_pair("code_challenge_method", pkce.method());
    url.into()
}

fn ensure_configured(credentials: &MarketplaceCredentials) -> Result<(), MarketplaceError> {
    if credentials.is_configured() {
        Ok(())
    } else {
        Err(MarketplaceError::NotConfigured(
            "Etsy integration is not configured".into(),
        ))
    }
}

/// Etsy is a public PKCE client: no client secret goes over the wire.
pub async fn exchange_code(
    client: &Client,
    credentials: &MarketplaceCredentials,
    code: &str,
    code_verifier: &str,
) -> Result<TokenResponse, MarketplaceError> {
    ensure_configured(credentials)?;
    let form = [
        ("grant_type", "authorization_code"),
        ("client_id", credentials.client_id.as_str()),
        ("redirect_uri", credentials.redirect_uri.as_str()),
        ("code", code),
        ("code_verifier", code_verifier),
    ];
    request_token(client, "etsy", TOKEN_URL, &form, None).await
}

pub async fn refresh_access_token(
    client: &Client,
    credentials: &MarketplaceCredentials,
    refresh_token: &str,
) -> Result<TokenResponse, MarketplaceError> {
    ensure_configured(credentials)?;
    let form = [
        ("grant_type", "refresh_token"),
        ("client_id", credentials.client_id.as_str()),
        ("refresh_token", refresh_token),
    ];
    request_token(client, "etsy", TOKEN_URL, &form, None).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn authorize_url_carries_pkce_challenge() {
        let credentials = MarketplaceCredentials {
            client_id: "keystring".into(),
            client_secret: String::new(),
            redirect_uri: "https://app.test/etsy/callback".into(),
            api_url: "https://openapi.etsy.com/v3".into(),
        };
        let pkce = PkcePair::from_verifier("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk".into());
        let url = url::Url::parse(&authorize_url(&credentials, "st", &pkce)).expect("url");
        let pairs: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(url.host_str(), Some("www.etsy.com"));
        assert_eq!(pairs["code_challenge"], "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
        assert_eq!(pairs["code_challenge_method"], "S256");
        assert_eq!(pairs["scope"], "listings_r listings_w transactions_r");
        assert_eq!(pairs["redirect_uri"], "https://app.test/etsy/callback");
        assert_eq!(pairs["state"], "st");
    }

    #[tokio::test]
    async fn refresh_requires_client_id() {
        let err = refresh_access_token(&Client::new(), &MarketplaceCredentials::default(), "r")
            .await
            .expect_err("not configured");
        assert_eq!(err.to_string(), "Etsy integration is not configured");
    }
}
