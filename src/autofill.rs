//! Turns a listing into the ordered field fills the browser extension
//! performs on a marketplace's own listing form.

use crate::{
    models::{Condition, Listing},
    selectors::{PageSource, SelectorRegistry},
};
use futures::future::join_all;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

/// Form fields in the order the extension fills them.
const FIELD_ORDER: &[&str] = &[
    "titleInput",
    "descriptionInput",
    "priceInput",
    "originalPriceInput",
    "brandInput",
    "conditionSelect",
    "conditionButton",
    "colorSelect",
    "postcodeInput",
    "fileInput",
];

const REQUIRED_FIELD: &str = "titleInput";
const MAX_DEPOP_TAGS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FillStep {
    pub key: String,
    pub css: String,
    pub version: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FillPlan {
    pub platform: String,
    pub config_version: String,
    /// False when the title field could not be located.
    pub ready: bool,
    pub steps: Vec<FillStep>,
    /// Fields that had a value but no matching element.
    pub missing: Vec<String>,
}

/// Values the listing itself does not carry.
#[derive(Debug, Clone, Default)]
pub struct FillExtras {
    pub postcode: Option<String>,
}

pub fn condition_label(platform: &str, condition: Option<Condition>) -> &'static str {
    let Some(condition) = condition else {
        return "Good";
    };
    match (platform, condition) {
        ("vinted", Condition::New) => "New with tags",
        ("vinted", Condition::UsedLikeNew) => "New without tags",
        ("vinted", Condition::UsedGood) => "Very good",
        ("vinted", Condition::UsedFair) => "Good",
        ("depop", Condition::New) => "Brand new",
        ("depop", Condition::UsedLikeNew) => "Like new",
        ("depop", Condition::UsedGood) => "Good",
        ("depop", Condition::UsedFair) => "Fair",
        ("poshmark", Condition::New) => "NWT",
        ("poshmark", Condition::UsedLikeNew) => "NWOT",
        ("poshmark", Condition::UsedGood) => "Good",
        ("poshmark", Condition::UsedFair) => "Fair",
        ("facebook", Condition::New) => "New",
        ("facebook", Condition::UsedLikeNew) => "Used - Like New",
        ("facebook", Condition::UsedGood) => "Used - Good",
        ("facebook", Condition::UsedFair) => "Used - Fair",
        _ => "Good",
    }
}

fn format_cm(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        value.to_string()
    }
}

fn dimensions_line(listing: &Listing) -> Option<String> {
    let parts: Vec<String> = [
        ("L", listing.dimensions_length_cm),
        ("W", listing.dimensions_width_cm),
        ("H", listing.dimensions_height_cm),
    ]
    .into_iter()
    .filter_map(|(label, value)| value.map(|v| format!("{label}: {}cm", format_cm(v))))
    .collect();
    (!parts.is_empty()).then(|| format!("Dimensions: {}", parts.join(" x ")))
}

fn hashtag(raw: &str) -> String {
    let tag: String = raw
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_lowercase();
    format!("#{tag}")
}

fn depop_tags(listing: &Listing) -> Vec<String> {
    let mut tags = vec!["#furniture".to_string()];
    for value in [&listing.brand, &listing.material, &listing.color]
        .into_iter()
        .flatten()
    {
        let tag = hashtag(value);
        if tag.len() > 1 {
            tags.push(tag);
        }
    }
    if listing.condition == Some(Condition::New) {
        tags.push("#brandnew".into());
    }
    tags.extend(["#homedecor", "#interiors", "#vintage"].map(String::from));
    tags.dedup();
    tags.truncate(MAX_DEPOP_TAGS);
    tags
}

/// The listing description followed by its physical details, one per line.
pub fn build_description(platform: &str, listing: &Listing) -> String {
    let mut text = listing
        .description
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .unwrap_or(&listing.title)
        .to_string();

    let mut details = Vec::new();
    if let Some(brand) = &listing.brand {
        details.push(format!("Brand: {brand}"));
    }
    if let Some(material) = &listing.material {
        details.push(format!("Material: {material}"));
    }
    if let Some(color) = &listing.color {
        details.push(format!("Colour: {color}"));
    }
    if let Some(dimensions) = dimensions_line(listing) {
        details.push(dimensions);
    }
    if !details.is_empty() {
        text.push_str("\n\n");
        text.push_str(&details.join("\n"));
    }
    if platform == "depop" {
        text.push_str("\n\n");
        text.push_str(&depop_tags(listing).join(" "));
    }
    text
}

fn format_price(price: f64) -> String {
    if price.fract() == 0.0 {
        format!("{price:.0}")
    } else {
        format!("{price:.2}")
    }
}

fn value_for(platform: &str, key: &str, listing: &Listing, extras: &FillExtras) -> Option<String> {
    match key {
        "titleInput" => Some(listing.title.clone()),
        "descriptionInput" => Some(build_description(platform, listing)),
        "priceInput" => Some(format_price(listing.price)),
        "originalPriceInput" => Some(format!("{}", (listing.price * 1.3).round())),
        "brandInput" => listing.brand.clone(),
        "conditionSelect" | "conditionButton" => {
            Some(condition_label(platform, listing.condition).to_string())
        }
        "colorSelect" => listing.color.clone(),
        "postcodeInput" => extras.postcode.clone(),
        "fileInput" => {
            let urls: Vec<&str> = listing.images.iter().map(|i| i.url.as_str()).collect();
            (!urls.is_empty()).then(|| urls.join("\n"))
        }
        _ => None,
    }
}

/// Resolves every field the platform's form has and the listing can fill.
///
/// Fields without a value are left out entirely. Fields with a value but no
/// matching element land in `missing`; the plan is only `ready` when the
/// title field resolved.
pub async fn plan_fill(
    registry: &SelectorRegistry,
    platform: &str,
    listing: &Listing,
    extras: &FillExtras,
    page: &dyn PageSource,
    timeout: Duration,
) -> FillPlan {
    let mut wanted = Vec::new();
    for key in FIELD_ORDER {
        if *key != REQUIRED_FIELD && registry.candidates(platform, key).await.is_empty() {
            continue;
        }
        if let Some(value) = value_for(platform, key, listing, extras) {
            wanted.push((*key, value));
        }
    }

    let resolutions = join_all(
        wanted
            .iter()
            .map(|(key, _)| registry.resolve(platform, key, page, timeout)),
    )
    .await;

    let mut steps = Vec::new();
    let mut missing = Vec::new();
    for ((key, value), resolution) in wanted.into_iter().zip(resolutions) {
        match resolution {
            Some(hit) => steps.push(FillStep {
                key: key.to_string(),
                css: hit.css,
                version: hit.version,
                value,
            }),
            None => missing.push(key.to_string()),
        }
    }

    let ready = steps.iter().any(|s| s.key == REQUIRED_FIELD);
    if ready {
        info!(
            target = "syncsellr.autofill",
            platform,
            listing_id = %listing.id,
            fields = steps.len(),
            missing = missing.len(),
            "fill plan ready"
        );
    } else {
        debug!(target = "syncsellr.autofill", platform, listing_id = %listing.id, "title field not found");
    }

    FillPlan {
        platform: platform.to_string(),
        config_version: registry.version().await,
        ready,
        steps,
        missing,
    }
}
