//! eBay Sell Inventory integration: OAuth, inventory items and offers.

pub mod auth;
pub mod inventory;
pub mod offers;

use crate::{
    config::{EbayPolicies, MarketplaceCredentials},
    connections,
    db::Database,
    error::AppError,
    marketplace::{ExternalStatus, MarketplaceAdapter, MarketplaceError, PublishResult},
    models::{Condition, Listing, Marketplace, MarketplaceListing},
};
use async_trait::async_trait;
use inventory::{InventoryAvailability, InventoryItemRequest, InventoryProduct, ProductPatch, ProductText};
use offers::CreateOfferRequest;
use reqwest::Client;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Everything an eBay adapter needs besides the user it acts for.
#[derive(Clone)]
pub struct EbayContext {
    pub db: Database,
    pub client: Client,
    pub credentials: MarketplaceCredentials,
    pub policies: EbayPolicies,
    pub public_base_url: String,
}

pub struct EbayAdapter {
    ctx: EbayContext,
    user_id: String,
}

impl EbayAdapter {
    pub fn new(ctx: EbayContext, user_id: impl Into<String>) -> Self {
        Self {
            ctx,
            user_id: user_id.into(),
        }
    }

    fn root(&self) -> &str {
        &self.ctx.credentials.api_url
    }

    async fn access_token(&self) -> Result<String, AppError> {
        let client = &self.ctx.client;
        let credentials = &self.ctx.credentials;
        connections::access_token(&self.ctx.db, &self.user_id, Marketplace::Ebay, |refresh| async move {
            auth::refresh_access_token(client, credentials, &refresh).await
        })
        .await
    }

    async fn publish(&self, listing: &Listing) -> Result<PublishResult, AppError> {
        let token = self.access_token().await?;
        let sku = sku_for(listing);
        let item = InventoryItemRequest {
            availability: InventoryAvailability::single(),
            condition: map_condition(listing.condition),
            product: InventoryProduct {
                title: listing.title.clone(),
                description: listing
                    .description
                    .clone()
                    .unwrap_or_else(|| listing.title.clone()),
                aspects: build_aspects(listing),
                image_urls: absolute_image_urls(listing, &self.ctx.public_base_url),
            },
        };
        inventory::upsert_inventory_item(&self.ctx.client, self.root(), &token, &sku, &item).await?;

        let offer = CreateOfferRequest::fixed_price(
            sku.clone(),
            listing.price,
            build_listing_description(listing),
            &self.ctx.policies,
        );
        let offer_id = offers::create_offer(&self.ctx.client, self.root(), &token, &offer).await?;
        let listing_id = offers::publish_offer(&self.ctx.client, self.root(), &token, &offer_id).await?;

        info!(
            target = "syncsellr.ebay",
            listing_id = %listing.id,
            ebay_listing_id = %listing_id,
            %sku,
            "listing published to eBay"
        );
        let url = listing_url(&listing_id);
        Ok(PublishResult::published(
            listing_id,
            Some(url),
            Some(json!({ "sku": sku, "offerId": offer_id })),
        ))
    }
}

#[async_trait]
impl MarketplaceAdapter for EbayAdapter {
    fn platform(&self) -> Marketplace {
        Marketplace::Ebay
    }

    async fn auth_url(&self) -> Result<String, AppError> {
        if !self.ctx.credentials.is_configured() {
            return Err(MarketplaceError::NotConfigured("eBay integration is not configured".into()).into());
        }
        let state = connections::begin_oauth(&self.ctx.db, &self.user_id, Marketplace::Ebay, None).await?;
        Ok(auth::authorize_url(&self.ctx.credentials, &state))
    }

    async fn handle_callback(&self, code: &str, state: &str) -> Result<(), AppError> {
        let claimed =
            connections::claim_oauth_state(&self.ctx.db, state, &self.user_id, Marketplace::Ebay).await?;
        connections::complete_oauth(
            &self.ctx.db,
            &claimed,
            auth::exchange_code(&self.ctx.client, &self.ctx.credentials, code),
        )
        .await?;
        Ok(())
    }

    async fn publish_listing(&self, listing: &Listing) -> Result<PublishResult, AppError> {
        match self.publish(listing).await {
            Ok(result) => Ok(result),
            Err(err) => {
                warn!(target = "syncsellr.ebay", listing_id = %listing.id, error = %err, "eBay publish failed");
                Ok(PublishResult::failed(failure_message(&err, "Failed to publish listing to eBay")))
            }
        }
    }

    async fn update_listing(&self, record: &MarketplaceListing, listing: &Listing) -> Result<PublishResult, AppError> {
        let external_id = record.external_id.clone().unwrap_or_default();
        let outcome = async {
            let token = self.access_token().await?;
            let patch = ProductPatch {
                product: ProductText {
                    title: Some(listing.title.clone()),
                    description: listing.description.clone(),
                },
            };
            inventory::upsert_inventory_item(&self.ctx.client, self.root(), &token, &record_sku(record), &patch)
                .await?;
            Ok::<_, AppError>(())
        }
        .await;
        match outcome {
            Ok(()) => Ok(PublishResult::published(external_id, None, None)),
            Err(err) => {
                warn!(target = "syncsellr.ebay", %external_id, error = %err, "eBay update failed");
                Ok(PublishResult::failed(failure_message(&err, "Failed to update listing on eBay")))
            }
        }
    }

    async fn delete_listing(&self, record: &MarketplaceListing) -> Result<(), AppError> {
        let token = self.access_token().await?;
        inventory::delete_inventory_item(&self.ctx.client, self.root(), &token, &record_sku(record)).await?;
        info!(target = "syncsellr.ebay", record_id = %record.id, "eBay inventory item deleted");
        Ok(())
    }

    async fn sync_status(&self, record: &MarketplaceListing) -> Result<ExternalStatus, AppError> {
        let outcome = async {
            let token = self.access_token().await?;
            let quantity =
                inventory::inventory_quantity(&self.ctx.client, self.root(), &token, &record_sku(record)).await?;
            Ok::<_, AppError>(status_from_quantity(quantity))
        }
        .await;
        Ok(outcome.unwrap_or_else(|err| {
            warn!(target = "syncsellr.ebay", record_id = %record.id, error = %err, "eBay status lookup failed");
            ExternalStatus::Error
        }))
    }
}

/// Client-facing errors keep their message; anything else gets the generic one.
pub(crate) fn failure_message(err: &AppError, generic: &str) -> String {
    match err {
        AppError::BadRequest(msg) | AppError::Unauthorized(msg) => msg.clone(),
        AppError::Marketplace(MarketplaceError::NotConfigured(msg) | MarketplaceError::Rejected(msg)) => {
            msg.clone()
        }
        _ => generic.to_string(),
    }
}

pub fn sku_for(listing: &Listing) -> String {
    listing
        .sku
        .clone()
        .filter(|sku| !sku.is_empty())
        .unwrap_or_else(|| format!("TF-{}", listing.id))
}

/// The inventory SKU a published record was created under.
fn record_sku(record: &MarketplaceListing) -> String {
    record
        .platform_data
        .as_ref()
        .and_then(|data| data.get("sku"))
        .and_then(|sku| sku.as_str())
        .map(str::to_string)
        .or_else(|| record.external_id.clone())
        .unwrap_or_default()
}

pub fn listing_url(listing_id: &str) -> String {
    format!("https://www.ebay.co.uk/itm/{listing_id}")
}

pub fn map_condition(condition: Option<Condition>) -> &'static str {
    match condition {
        Some(Condition::New) => "NEW",
        Some(Condition::UsedLikeNew) => "LIKE_NEW",
        Some(Condition::UsedGood) => "VERY_GOOD",
        Some(Condition::UsedFair) => "GOOD",
        None => "USED_EXCELLENT",
    }
}

pub fn build_aspects(listing: &Listing) -> BTreeMap<String, Vec<String>> {
    let mut aspects = BTreeMap::new();
    for (name, value) in [
        ("Brand", &listing.brand),
        ("Material", &listing.material),
        ("Colour", &listing.color),
    ] {
        if let Some(value) = value.as_ref().filter(|v| !v.is_empty()) {
            aspects.insert(name.to_string(), vec![value.clone()]);
        }
    }
    aspects
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

pub fn build_listing_description(listing: &Listing) -> String {
    let mut desc = format!(
        "<h2>{}</h2><p>{}</p>",
        escape_html(&listing.title),
        escape_html(listing.description.as_deref().unwrap_or_default())
    );
    if listing.has_dimensions() {
        desc.push_str("<h3>Dimensions</h3><ul>");
        for (label, value) in [
            ("Length", listing.dimensions_length_cm),
            ("Width", listing.dimensions_width_cm),
            ("Height", listing.dimensions_height_cm),
        ] {
            if let Some(value) = value {
                desc.push_str(&format!("<li>{label}: {}cm</li>", escape_html(&value.to_string())));
            }
        }
        desc.push_str("</ul>");
    }
    desc
}

pub fn status_from_quantity(quantity: Option<i64>) -> ExternalStatus {
    match quantity {
        Some(0) => ExternalStatus::Sold,
        Some(q) if q > 0 => ExternalStatus::Active,
        _ => ExternalStatus::Error,
    }
}

pub(crate) fn absolute_image_urls(listing: &Listing, base_url: &str) -> Vec<String> {
    let mut images: Vec<_> = listing.images.iter().collect();
    images.sort_by_key(|image| image.position);
    images
        .into_iter()
        .map(|image| {
            if image.url.starts_with("http://") || image.url.starts_with("https://") {
                image.url.clone()
            } else {
                format!("{base_url}{}", image.url)
            }
        })
        .collect()
}
