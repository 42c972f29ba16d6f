use crate::{
    config::MarketplaceCredentials,
    marketplace::{
        MarketplaceError,
        oauth::{BasicCredentials, TokenResponse, request_token},
    },
};
use reqwest::Client;

pub const AUTHORIZE_URL: &str = "https://auth.ebay.com/oauth2/authorize";

pub const SCOPES: &[&str] = &[
    "https://api.ebay.com/oauth/api_scope/sell.inventory",
    "https://api.ebay.com/oauth/api_scope/sell.account",
    "https://api.ebay.com/oauth/api_scope/sell.fulfillment",
];

pub fn authorize_url(credentials: &MarketplaceCredentials, state: &str) -> String {
    let mut url = url::Url::parse(AUTHORIZE_URL).expect("static eBay authorize URL");
    url.query_pairs_mut()
        .append_pair("client_id", &credentials.client_id)
        .append_pair("redirect_uri", &credentials.redirect_uri)
        .append_pair("response_type", "code")
        .append_pair("state", state)
        .append_pair("scope", &SCOPES.join(" "));
    url.into()
}

fn token_url(credentials: &MarketplaceCredentials) -> String {
    format!("{}/identity/v1/oauth2/token", credentials.api_url)
}

fn basic(credentials: &MarketplaceCredentials) -> Result<BasicCredentials<'_>, MarketplaceError> {
    if !credentials.is_configured() || credentials.client_secret.is_empty() {
        return Err(MarketplaceError::NotConfigured(
            "eBay integration is not configured".into(),
        ));
    }
    Ok(BasicCredentials {
        client_id: &credentials.client_id,
        client_secret: &credentials.client_secret,
    })
}

pub async fn exchange_code(
    client: &Client,
    credentials: &MarketplaceCredentials,
    code: &str,
) -> Result<TokenResponse, MarketplaceError> {
    let form = [
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", credentials.redirect_uri.as_str()),
    ];
    request_token(client, "ebay", &token_url(credentials), &form, Some(basic(credentials)?)).await
}

pub async fn refresh_access_token(
    client: &Client,
    credentials: &MarketplaceCredentials,
    refresh_token: &str,
) -> Result<TokenResponse, MarketplaceError> {
    let form = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
    ];
    request_token(client, "ebay", &token_url(credentials), &form, Some(basic(credentials)?)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> MarketplaceCredentials {
        MarketplaceCredentials {
            client_id: "app-id".into(),
            client_secret: "cert".into(),
            redirect_uri: "Seller-RuName".into(),
            api_url: "https://api.ebay.com".into(),
        }
    }

    #[test]
    fn authorize_url_carries_state_and_scopes() {
        let url = url::Url::parse(&authorize_url(&credentials(), "abc123")).expect("url");
        assert_eq!(url.host_str(), Some("auth.ebay.com"));
        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["client_id"], "app-id");
        assert_eq!(pairs["state"], "abc123");
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["scope"].split(' ').count(), 3);
    }

    #[tokio::test]
    async fn missing_credentials_fail_before_any_request() {
        let err = exchange_code(&Client::new(), &MarketplaceCredentials::default(), "code")
            .await
            .expect_err("not configured");
        assert!(matches!(err, MarketplaceError::NotConfigured(_)));
    }
}
