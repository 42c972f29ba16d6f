//! API-based marketplace integrations.
//!
//! Each marketplace is an adapter bound to one user; the [`MarketplaceRegistry`]
//! hands out adapters per user and caches them briefly.

pub mod oauth;
pub mod registry;

pub use registry::MarketplaceRegistry;

use crate::{
    circuit_breaker::{CircuitError, CircuitOpen},
    error::AppError,
    models::{Listing, Marketplace, MarketplaceListing, MarketplaceListingStatus},
};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use serde_with::skip_serializing_none;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MarketplaceError {
    #[error("{marketplace} responded with HTTP {status}")]
    Status {
        marketplace: &'static str,
        status: u16,
    },
    #[error("request failed: {0}")]
    Request(String),
    #[error("{0}")]
    NotConfigured(String),
    #[error("{0}")]
    Rejected(String),
    #[error(transparent)]
    CircuitOpen(CircuitOpen),
}

impl From<reqwest::Error> for MarketplaceError {
    fn from(err: reqwest::Error) -> Self {
        MarketplaceError::Request(err.to_string())
    }
}

impl From<CircuitError<MarketplaceError>> for MarketplaceError {
    fn from(err: CircuitError<MarketplaceError>) -> Self {
        match err {
            CircuitError::Open(open) => MarketplaceError::CircuitOpen(open),
            CircuitError::Inner(inner) => inner,
        }
    }
}

/// Fails with [`MarketplaceError::Status`] unless the response is 2xx.
pub fn ensure_success(
    marketplace: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, MarketplaceError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(MarketplaceError::Status {
            marketplace,
            status: status.as_u16(),
        })
    }
}

/// Listing state as reported by the marketplace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalStatus {
    Active,
    Sold,
    Ended,
    Error,
}

impl From<ExternalStatus> for MarketplaceListingStatus {
    fn from(status: ExternalStatus) -> Self {
        match status {
            ExternalStatus::Active => MarketplaceListingStatus::Active,
            ExternalStatus::Sold => MarketplaceListingStatus::Sold,
            ExternalStatus::Ended => MarketplaceListingStatus::Ended,
            ExternalStatus::Error => MarketplaceListingStatus::Error,
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishResult {
    pub success: bool,
    pub external_id: Option<String>,
    pub external_url: Option<String>,
    pub platform_data: Option<Value>,
    pub error: Option<String>,
}

impl PublishResult {
    pub fn published(external_id: String, external_url: Option<String>, platform_data: Option<Value>) -> Self {
        Self {
            success: true,
            external_id: Some(external_id),
            external_url,
            platform_data,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait MarketplaceAdapter: Send + Sync {
    fn platform(&self) -> Marketplace;

    /// Authorization URL the user is redirected to; records the OAuth state.
    async fn auth_url(&self) -> Result<String, AppError>;

    /// Completes the OAuth flow and stores the tokens on the user's connection.
    async fn handle_callback(&self, code: &str, state: &str) -> Result<(), AppError>;

    /// Failures of the marketplace call itself come back as `success: false`.
    async fn publish_listing(&self, listing: &Listing) -> Result<PublishResult, AppError>;

    /// Pushes the listing's current title and description to an already published record.
    async fn update_listing(&self, record: &MarketplaceListing, listing: &Listing) -> Result<PublishResult, AppError>;

    async fn delete_listing(&self, record: &MarketplaceListing) -> Result<(), AppError>;

    /// Lookup failures map to [`ExternalStatus::Error`].
    async fn sync_status(&self, record: &MarketplaceListing) -> Result<ExternalStatus, AppError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_errors_unwrap_to_marketplace_errors() {
        let open: MarketplaceError = CircuitError::<MarketplaceError>::Open(CircuitOpen { breaker: "etsy" }).into();
        assert!(matches!(open, MarketplaceError::CircuitOpen(_)));
        let inner: MarketplaceError = CircuitError::Inner(MarketplaceError::Status {
            marketplace: "etsy",
            status: 500,
        })
        .into();
        assert_eq!(inner.to_string(), "etsy responded with HTTP 500");
    }

    #[test]
    fn failed_publish_omits_empty_fields() {
        let json = serde_json::to_value(PublishResult::failed("nope")).expect("json");
        assert_eq!(json, serde_json::json!({"success": false, "error": "nope"}));
    }

    #[test]
    fn external_status_maps_onto_record_status() {
        assert_eq!(
            MarketplaceListingStatus::from(ExternalStatus::Sold),
            MarketplaceListingStatus::Sold
        );
        assert!(MarketplaceListingStatus::from(ExternalStatus::Ended).is_terminal());
    }
}
