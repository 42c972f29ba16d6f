use super::{MarketplaceError, ensure_success};
use crate::db::StoredTokens;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};

/// 32 random bytes, hex encoded.
pub fn generate_state() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    pub fn generate() -> Self {
        Self::from_verifier(URL_SAFE_NO_PAD.encode(rand::random::<[u8; 32]>()))
    }

    pub fn from_verifier(verifier: String) -> Self {
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        Self {
            verifier,
            challenge,
        }
    }

    pub fn method(&self) -> &'static str {
        "S256"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: i64,
}

impl TokenResponse {
    pub fn into_stored(self) -> StoredTokens {
        StoredTokens {
            access_token: self.access_token,
            refresh_token: self.refresh_token.filter(|t| !t.is_empty()),
            expires_at: Utc::now() + Duration::seconds(self.expires_in),
        }
    }
}

/// Client credentials sent as HTTP Basic on the token request.
pub struct BasicCredentials<'a> {
    pub client_id: &'a str,
    pub client_secret: &'a str,
}

/// Form-encoded POST to an OAuth token endpoint.
pub async fn request_token(
    client: &Client,
    marketplace: &'static str,
    url: &str,
    form: &[(&str, &str)],
    basic: Option<BasicCredentials<'_>>,
) -> Result<TokenResponse, MarketplaceError> {
    let mut request = client.post(url).form(form);
    if let Some(basic) = basic {
        request = request.basic_auth(basic.client_id, Some(basic.client_secret));
    }
    let response = ensure_success(marketplace, request.send().await?)?;
    Ok(response.json::<TokenResponse>().await?)
}
