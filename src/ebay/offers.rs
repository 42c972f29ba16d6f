use crate::{
    config::EbayPolicies,
    marketplace::{MarketplaceError, ensure_success},
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use urlencoding::encode;

pub const MARKETPLACE_ID: &str = "EBAY_GB";
pub const CURRENCY: &str = "GBP";
pub const DEFAULT_CATEGORY_ID: &str = "38208";

#[derive(Debug, Clone, Serialize)]
pub struct PricingSummary {
    pub price: Price,
}

#[derive(Debug, Clone, Serialize)]
pub struct Price {
    pub value: String,
    pub currency: String,
}

impl Price {
    pub fn from_amount(amount: f64, currency: &str) -> Self {
        Self {
            value: format!("{amount:.2}"),
            currency: currency.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingPolicies {
    pub fulfillment_policy_id: String,
    pub payment_policy_id: String,
    pub return_policy_id: String,
}

impl From<&EbayPolicies> for ListingPolicies {
    fn from(policies: &EbayPolicies) -> Self {
        Self {
            fulfillment_policy_id: policies.fulfillment_policy_id.clone(),
            payment_policy_id: policies.payment_policy_id.clone(),
            return_policy_id: policies.return_policy_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOfferRequest {
    pub sku: String,
    pub marketplace_id: &'static str,
    pub format: &'static str,
    pub available_quantity: i32,
    pub category_id: String,
    pub listing_policies: ListingPolicies,
    pub pricing_summary: PricingSummary,
    pub listing_description: String,
    pub merchant_location_key: String,
}

impl CreateOfferRequest {
    pub fn fixed_price(sku: String, price: f64, description: String, policies: &EbayPolicies) -> Self {
        Self {
            sku,
            marketplace_id: MARKETPLACE_ID,
            format: "FIXED_PRICE",
            available_quantity: 1,
            category_id: DEFAULT_CATEGORY_ID.to_string(),
            listing_policies: policies.into(),
            pricing_summary: PricingSummary {
                price: Price::from_amount(price, CURRENCY),
            },
            listing_description: description,
            merchant_location_key: policies.merchant_location_key.clone(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OfferResponse {
    offer_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    listing_id: Option<String>,
}

pub async fn create_offer(
    client: &Client,
    root: &str,
    access_token: &str,
    request: &CreateOfferRequest,
) -> Result<String, MarketplaceError> {
    let response = client
        .post(format!("{root}/sell/inventory/v1/offer"))
        .bearer_auth(access_token)
        .json(request)
        .send()
        .await?;
    let payload: OfferResponse = ensure_success("ebay", response)?.json().await?;
    Ok(payload.offer_id)
}

/// Publishes the offer and returns the eBay listing id.
pub async fn publish_offer(
    client: &Client,
    root: &str,
    access_token: &str,
    offer_id: &str,
) -> Result<String, MarketplaceError> {
    let response = client
        .post(format!(
            "{root}/sell/inventory/v1/offer/{}/publish",
            encode(offer_id)
        ))
        .bearer_auth(access_token)
        .json(&serde_json::json!({}))
        .send()
        .await?;
    let payload: PublishResponse = ensure_success("ebay", response)?.json().await?;
    payload
        .listing_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| MarketplaceError::Rejected("eBay did not return a listing id".into()))
}
