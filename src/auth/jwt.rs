//! Minimal HS256 JSON Web Tokens.
//!
//! Only `HS256` is produced or accepted. Verification rejects any other
//! `alg`, compares the signature in constant time, and enforces both `exp`
//! and a maximum age measured from `iat`.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub const ALGORITHM: &str = "HS256";
pub const MAX_TOKEN_LEN: usize = 2048;
pub const ACCESS_TTL: Duration = Duration::from_secs(15 * 60);
pub const REFRESH_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JwtError {
    #[error("token exceeds {MAX_TOKEN_LEN} characters")]
    TooLong,
    #[error("malformed token")]
    Malformed,
    #[error("unsupported algorithm")]
    Algorithm,
    #[error("signature mismatch")]
    Signature,
    #[error("token expired")]
    Expired,
    #[error("token too old")]
    TooOld,
    #[error("could not encode token: {0}")]
    Encode(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    #[serde(default)]
    typ: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

fn mac(secret: &[u8]) -> Result<HmacSha256, JwtError> {
    HmacSha256::new_from_slice(secret).map_err(|err| JwtError::Encode(err.to_string()))
}

pub fn encode(claims: &Claims, secret: &[u8]) -> Result<String, JwtError> {
    let header = serde_json::to_vec(&Header {
        alg: ALGORITHM.to_string(),
        typ: Some("JWT".to_string()),
    })
    .map_err(|err| JwtError::Encode(err.to_string()))?;
    let payload = serde_json::to_vec(claims).map_err(|err| JwtError::Encode(err.to_string()))?;
    let signing_input = format!("{}.{}", URL_SAFE_NO_PAD.encode(header), URL_SAFE_NO_PAD.encode(payload));
    let mut mac = mac(secret)?;
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    Ok(format!("{signing_input}.{signature}"))
}

/// Verifies `token` at time `now` (unix seconds).
pub fn decode(token: &str, secret: &[u8], max_age: Duration, now: i64) -> Result<Claims, JwtError> {
    if token.len() > MAX_TOKEN_LEN {
        return Err(JwtError::TooLong);
    }
    let mut parts = token.split('.');
    let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(JwtError::Malformed);
    };

    let header: Header = URL_SAFE_NO_PAD
        .decode(header_b64)
        .ok()
        .and_then(|raw| serde_json::from_slice(&raw).ok())
        .ok_or(JwtError::Malformed)?;
    if header.alg != ALGORITHM {
        return Err(JwtError::Algorithm);
    }

    let signature = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| JwtError::Malformed)?;
    let mut mac = mac(secret)?;
    mac.update(header_b64.as_bytes());
    mac.update(b".");
    mac.update(payload_b64.as_bytes());
    mac.verify_slice(&signature).map_err(|_| JwtError::Signature)?;

    let claims: Claims = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .ok()
        .and_then(|raw| serde_json::from_slice(&raw).ok())
        .ok_or(JwtError::Malformed)?;
    if claims.user_id.is_empty() {
        return Err(JwtError::Malformed);
    }
    if now >= claims.exp {
        return Err(JwtError::Expired);
    }
    if now - claims.iat > max_age.as_secs() as i64 {
        return Err(JwtError::TooOld);
    }
    Ok(claims)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Signs and verifies the two token kinds with their separate secrets.
#[derive(Clone)]
pub struct TokenIssuer {
    access_secret: Arc<[u8]>,
    refresh_secret: Arc<[u8]>,
}

impl TokenIssuer {
    pub fn new(access_secret: &str, refresh_secret: &str) -> Self {
        Self {
            access_secret: Arc::from(access_secret.as_bytes()),
            refresh_secret: Arc::from(refresh_secret.as_bytes()),
        }
    }

    pub fn issue(&self, user_id: &str) -> Result<TokenPair, JwtError> {
        self.issue_at(user_id, chrono::Utc::now().timestamp())
    }

    fn issue_at(&self, user_id: &str, now: i64) -> Result<TokenPair, JwtError> {
        let access = Claims {
            user_id: user_id.to_string(),
            jti: None,
            iat: now,
            exp: now + ACCESS_TTL.as_secs() as i64,
        };
        let refresh = Claims {
            user_id: user_id.to_string(),
            jti: Some(Uuid::new_v4().to_string()),
            iat: now,
            exp: now + REFRESH_TTL.as_secs() as i64,
        };
        Ok(TokenPair {
            access_token: encode(&access, &self.access_secret)?,
            refresh_token: encode(&refresh, &self.refresh_secret)?,
        })
    }

    pub fn verify_access(&self, token: &str) -> Result<Claims, JwtError> {
        decode(token, &self.access_secret, ACCESS_TTL, chrono::Utc::now().timestamp())
    }

    pub fn verify_refresh(&self, token: &str) -> Result<Claims, JwtError> {
        decode(token, &self.refresh_secret, REFRESH_TTL, chrono::Utc::now().timestamp())
    }
}
