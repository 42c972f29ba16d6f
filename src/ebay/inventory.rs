use crate::marketplace::{MarketplaceError, ensure_success};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use urlencoding::encode;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryItemRequest {
    pub availability: InventoryAvailability,
    pub condition: &'static str,
    pub product: InventoryProduct,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryAvailability {
    pub ship_to_location_availability: ShipToLocationAvailability,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipToLocationAvailability {
    pub quantity: Option<i64>,
}

impl InventoryAvailability {
    pub fn single() -> Self {
        Self {
            ship_to_location_availability: ShipToLocationAvailability { quantity: Some(1) },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryProduct {
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub aspects: BTreeMap<String, Vec<String>>,
    pub image_urls: Vec<String>,
}

/// Title and description only, for edits after publishing.
#[derive(Debug, Clone, Serialize)]
pub struct ProductPatch {
    pub product: ProductText,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProductText {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InventoryItemResponse {
    availability: Option<InventoryAvailability>,
}

fn item_url(root: &str, sku: &str) -> String {
    format!("{root}/sell/inventory/v1/inventory_item/{}", encode(sku))
}

pub async fn upsert_inventory_item<T: Serialize>(
    client: &Client,
    root: &str,
    access_token: &str,
    sku: &str,
    payload: &T,
) -> Result<(), MarketplaceError> {
    let response = client
        .put(item_url(root, sku))
        .bearer_auth(access_token)
        .header("Content-Language", "en-GB")
        .json(payload)
        .send()
        .await?;
    ensure_success("ebay", response)?;
    Ok(())
}

/// Available quantity, `None` when eBay does not report one.
pub async fn inventory_quantity(
    client: &Client,
    root: &str,
    access_token: &str,
    sku: &str,
) -> Result<Option<i64>, MarketplaceError> {
    let response = client
        .get(item_url(root, sku))
        .bearer_auth(access_token)
        .send()
        .await?;
    let item: InventoryItemResponse = ensure_success("ebay", response)?.json().await?;
    Ok(item
        .availability
        .and_then(|a| a.ship_to_location_availability.quantity))
}

pub async fn delete_inventory_item(
    client: &Client,
    root: &str,
    access_token: &str,
    sku: &str,
) -> Result<(), MarketplaceError> {
    let response = client
        .delete(item_url(root, sku))
        .bearer_auth(access_token)
        .send()
        .await?;
    ensure_success("ebay", response)?;
    Ok(())
}
