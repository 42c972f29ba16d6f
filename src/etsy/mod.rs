//! Etsy Open API v3 integration. OAuth uses PKCE; every API call goes
//! through a shared circuit breaker.

pub mod api;
pub mod auth;

use crate::{
    circuit_breaker::CircuitBreaker,
    config::MarketplaceCredentials,
    connections,
    db::Database,
    ebay::{absolute_image_urls, failure_message},
    error::AppError,
    marketplace::{
        ExternalStatus, MarketplaceAdapter, MarketplaceError, PublishResult, oauth::PkcePair,
    },
    models::{Listing, Marketplace, MarketplaceListing},
};
use api::{CreateListingRequest, EtsyApi};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Map, Value, json};
use std::{future::Future, sync::Arc};
use tracing::{info, warn};

pub const MAX_TITLE_CHARS: usize = 140;
pub const MAX_TAGS: usize = 13;
pub const MAX_IMAGES: usize = 10;
const DEFAULT_TAXONOMY_ID: u32 = 891;

#[derive(Clone)]
pub struct EtsyContext {
    pub db: Database,
    pub client: Client,
    pub credentials: MarketplaceCredentials,
    pub breaker: Arc<CircuitBreaker>,
    pub public_base_url: String,
}

pub struct EtsyAdapter {
    ctx: EtsyContext,
    user_id: String,
}

impl EtsyAdapter {
    pub fn new(ctx: EtsyContext, user_id: impl Into<String>) -> Self {
        Self {
            ctx,
            user_id: user_id.into(),
        }
    }

    fn api<'a>(&'a self, access_token: &'a str) -> EtsyApi<'a> {
        EtsyApi {
            client: &self.ctx.client,
            root: &self.ctx.credentials.api_url,
            api_key: &self.ctx.credentials.client_id,
            access_token,
        }
    }

    async fn access_token(&self) -> Result<String, AppError> {
        let client = &self.ctx.client;
        let credentials = &self.ctx.credentials;
        connections::access_token(&self.ctx.db, &self.user_id, Marketplace::Etsy, |refresh| async move {
            auth::refresh_access_token(client, credentials, &refresh).await
        })
        .await
    }

    async fn guarded<T, F, Fut>(&self, call: F) -> Result<T, MarketplaceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, MarketplaceError>>,
    {
        Ok(self.ctx.breaker.execute(call).await?)
    }

    async fn publish(&self, listing: &Listing) -> Result<PublishResult, AppError> {
        let token = self.access_token().await?;
        let api = self.api(&token);
        let (shop_id, listing_id) = self
            .guarded(|| async {
                let shop_id = api.shop_id().await?;
                let shipping_profile_id = api.shipping_profile_id(shop_id).await?;
                let request = create_listing_request(listing, shipping_profile_id);
                let listing_id = api.create_listing(shop_id, &request).await?;
                Ok((shop_id, listing_id))
            })
            .await?;

        self.upload_images(&api, shop_id, listing_id, listing).await;
        info!(
            target = "syncsellr.etsy",
            listing_id = %listing.id,
            etsy_listing_id = listing_id,
            shop_id,
            "listing published to Etsy"
        );
        let external_id = listing_id.to_string();
        Ok(PublishResult::published(
            external_id.clone(),
            Some(listing_url(&external_id)),
            Some(json!({ "shopId": shop_id })),
        ))
    }

    /// Image failures never fail the publish; the listing exists either way.
    async fn upload_images(&self, api: &EtsyApi<'_>, shop_id: i64, listing_id: i64, listing: &Listing) {
        let urls = absolute_image_urls(listing, &self.ctx.public_base_url);
        for url in urls.into_iter().take(MAX_IMAGES) {
            let uploaded = async {
                let bytes = api::fetch_image(&self.ctx.client, &url).await?;
                api.upload_image(shop_id, listing_id, bytes).await
            }
            .await;
            if let Err(err) = uploaded {
                warn!(target = "syncsellr.etsy", etsy_listing_id = listing_id, %url, error = %err, "image upload failed");
            }
        }
    }
}

#[async_trait]
impl MarketplaceAdapter for EtsyAdapter {
    fn platform(&self) -> Marketplace {
        Marketplace::Etsy
    }

    async fn auth_url(&self) -> Result<String, AppError> {
        if !self.ctx.credentials.is_configured() {
            return Err(MarketplaceError::NotConfigured("Etsy integration is not configured".into()).into());
        }
        let pkce = PkcePair::generate();
        let state = connections::begin_oauth(
            &self.ctx.db,
            &self.user_id,
            Marketplace::Etsy,
            Some(pkce.verifier.clone()),
        )
        .await?;
        Ok(auth::authorize_url(&self.ctx.credentials, &state, &pkce))
    }

    async fn handle_callback(&self, code: &str, state: &str) -> Result<(), AppError> {
        let claimed =
            connections::claim_oauth_state(&self.ctx.db, state, &self.user_id, Marketplace::Etsy).await?;
        let Some(verifier) = claimed.code_verifier.clone() else {
            self.ctx.db.delete_oauth_state(&claimed.state).await?;
            return Err(AppError::bad_request("Invalid OAuth state"));
        };
        connections::complete_oauth(
            &self.ctx.db,
            &claimed,
            auth::exchange_code(&self.ctx.client, &self.ctx.credentials, code, &verifier),
        )
        .await?;
        Ok(())
    }

    async fn publish_listing(&self, listing: &Listing) -> Result<PublishResult, AppError> {
        match self.publish(listing).await {
            Ok(result) => Ok(result),
            Err(err @ AppError::Marketplace(MarketplaceError::CircuitOpen(_))) => Err(err),
            Err(err) => {
                warn!(target = "syncsellr.etsy", listing_id = %listing.id, error = %err, "Etsy publish failed");
                Ok(PublishResult::failed(failure_message(&err, "Failed to publish listing to Etsy")))
            }
        }
    }

    async fn update_listing(&self, record: &MarketplaceListing, listing: &Listing) -> Result<PublishResult, AppError> {
        let external_id = record.external_id.clone().unwrap_or_default();
        let outcome = async {
            let token = self.access_token().await?;
            let api = self.api(&token);
            let changes = listing_changes(listing);
            self.guarded(|| api.update_listing(&external_id, &changes)).await?;
            Ok::<_, AppError>(())
        }
        .await;
        match outcome {
            Ok(()) => Ok(PublishResult::published(external_id, record.external_url.clone(), None)),
            Err(err @ AppError::Marketplace(MarketplaceError::CircuitOpen(_))) => Err(err),
            Err(err) => {
                warn!(target = "syncsellr.etsy", %external_id, error = %err, "Etsy update failed");
                Ok(PublishResult::failed(failure_message(&err, "Failed to update listing on Etsy")))
            }
        }
    }

    async fn delete_listing(&self, record: &MarketplaceListing) -> Result<(), AppError> {
        let external_id = record.external_id.clone().unwrap_or_default();
        let token = self.access_token().await?;
        let api = self.api(&token);
        self.guarded(|| api.delete_listing(&external_id)).await?;
        info!(target = "syncsellr.etsy", record_id = %record.id, %external_id, "Etsy listing deleted");
        Ok(())
    }

    async fn sync_status(&self, record: &MarketplaceListing) -> Result<ExternalStatus, AppError> {
        let external_id = record.external_id.clone().unwrap_or_default();
        let outcome = async {
            let token = self.access_token().await?;
            let api = self.api(&token);
            let state = self.guarded(|| api.listing_state(&external_id)).await?;
            Ok::<_, AppError>(status_from_state(state.as_deref()))
        }
        .await;
        match outcome {
            Ok(status) => Ok(status),
            Err(err @ AppError::Marketplace(MarketplaceError::CircuitOpen(_))) => Err(err),
            Err(err) => {
                warn!(target = "syncsellr.etsy", record_id = %record.id, error = %err, "Etsy status lookup failed");
                Ok(ExternalStatus::Error)
            }
        }
    }
}

pub fn listing_url(listing_id: &str) -> String {
    format!("https://www.etsy.com/listing/{listing_id}")
}

pub fn truncate_title(title: &str) -> String {
    title.chars().take(MAX_TITLE_CHARS).collect()
}

pub fn taxonomy_id(category: Option<&str>) -> u32 {
    match category.map(|c| c.trim().to_ascii_lowercase()).as_deref() {
        Some("furniture") => 891,
        Some("vintage") => 66,
        Some("handmade") => 69,
        _ => DEFAULT_TAXONOMY_ID,
    }
}

/// Up to five longer title words, then the listing's attributes, then a
/// catch-all, capped at Etsy's tag limit.
pub fn build_tags(listing: &Listing) -> Vec<String> {
    let mut tags: Vec<String> = listing
        .title
        .split_whitespace()
        .filter(|word| word.chars().count() > 2)
        .take(5)
        .map(str::to_string)
        .collect();
    for value in [&listing.brand, &listing.material, &listing.color] {
        if let Some(value) = value.as_ref().filter(|v| !v.is_empty()) {
            tags.push(value.clone());
        }
    }
    tags.push("furniture".to_string());
    tags.truncate(MAX_TAGS);
    tags
}

pub fn create_listing_request(listing: &Listing, shipping_profile_id: i64) -> CreateListingRequest {
    CreateListingRequest {
        title: truncate_title(&listing.title),
        description: listing
            .description
            .clone()
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| listing.title.clone()),
        price: listing.price,
        quantity: 1,
        taxonomy_id: taxonomy_id(listing.category.as_deref()),
        who_made: "someone_else",
        when_made: "before_2000",
        is_supply: false,
        shipping_profile_id,
        tags: build_tags(listing),
    }
}

fn listing_changes(listing: &Listing) -> Value {
    let mut changes = Map::new();
    changes.insert("title".into(), Value::String(truncate_title(&listing.title)));
    if let Some(description) = listing.description.as_ref().filter(|d| !d.is_empty()) {
        changes.insert("description".into(), Value::String(description.clone()));
    }
    Value::Object(changes)
}

pub fn status_from_state(state: Option<&str>) -> ExternalStatus {
    match state {
        Some("active") => ExternalStatus::Active,
        Some("sold_out") => ExternalStatus::Sold,
        Some("inactive" | "expired" | "removed") => ExternalStatus::Ended,
        _ => ExternalStatus::Error,
    }
}
