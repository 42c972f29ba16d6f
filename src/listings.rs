//! Listing rules: field validation, SKU generation, and the publish and
//! status flows layered over the listing tables.

use crate::{
    autofill::{self, FillExtras, FillPlan},
    connections::display_name,
    db::{Database, DeleteOutcome, ListingChanges, ListingQuery, MarketplaceListingUpdate, NewListing},
    error::{AppError, FieldError},
    jobs::{JobKind, JobQueue, Priority},
    marketplace::MarketplaceRegistry,
    models::{Condition, Listing, ListingStatus, Marketplace, MarketplaceListing, MarketplaceListingStatus},
    selectors::{MAX_SNAPSHOT_BYTES, SelectorRegistry, StaticPage},
    uploads::UploadStore,
};
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{str::FromStr, time::Duration};
use tracing::{info, warn};
use uuid::Uuid;

const SKU_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DEFAULT_LIMIT: u32 = 20;

/// Listing fields as clients send them. Every field is optional here so
/// creation and partial updates share one shape.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingInput {
    pub title: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub condition: Option<String>,
    pub brand: Option<String>,
    pub material: Option<String>,
    pub color: Option<String>,
    pub dimensions_length_cm: Option<f64>,
    pub dimensions_width_cm: Option<f64>,
    pub dimensions_height_cm: Option<f64>,
    pub sku: Option<String>,
    pub cost_price: Option<f64>,
    pub notes: Option<String>,
    pub category: Option<String>,
    pub status: Option<String>,
}

/// `TF-<unix millis>-<9 uppercase base36 chars>`.
pub fn generate_sku() -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..9)
        .map(|_| SKU_ALPHABET[rng.random_range(0..SKU_ALPHABET.len())] as char)
        .collect();
    format!("TF-{}-{suffix}", Utc::now().timestamp_millis())
}

fn trimmed(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn check_title(title: &str, errors: &mut Vec<FieldError>) {
    let len = title.chars().count();
    if len < 5 {
        errors.push(FieldError::new("title", "Title must be at least 5 characters"));
    } else if len > 255 {
        errors.push(FieldError::new("title", "Title must be at most 255 characters"));
    }
}

fn check_positive(field: &str, value: Option<f64>, errors: &mut Vec<FieldError>) {
    if let Some(value) = value
        && !(value.is_finite() && value > 0.0)
    {
        errors.push(FieldError::new(field, "Must be a positive number"));
    }
}

fn parse_condition(raw: Option<&str>, errors: &mut Vec<FieldError>) -> Option<Condition> {
    let raw = raw?;
    match Condition::from_str(raw.trim()) {
        Ok(condition) => Some(condition),
        Err(_) => {
            errors.push(FieldError::new(
                "condition",
                "Condition must be one of new, used_like_new, used_good, used_fair",
            ));
            None
        }
    }
}

fn check_numbers(input: &ListingInput, errors: &mut Vec<FieldError>) {
    check_positive("price", input.price, errors);
    check_positive("dimensionsLengthCm", input.dimensions_length_cm, errors);
    check_positive("dimensionsWidthCm", input.dimensions_width_cm, errors);
    check_positive("dimensionsHeightCm", input.dimensions_height_cm, errors);
    check_positive("costPrice", input.cost_price, errors);
}

/// Full validation for a new listing. A missing SKU is generated.
pub fn validate_new(input: ListingInput) -> Result<NewListing, AppError> {
    let mut errors = Vec::new();
    let title = trimmed(input.title.clone());
    match &title {
        Some(title) => check_title(title, &mut errors),
        None => errors.push(FieldError::new("title", "Title is required")),
    }
    if input.price.is_none() {
        errors.push(FieldError::new("price", "Price is required"));
    }
    check_numbers(&input, &mut errors);
    let condition = parse_condition(input.condition.as_deref(), &mut errors);
    if input.condition.is_none() {
        errors.push(FieldError::new("condition", "Condition is required"));
    }
    if !errors.is_empty() {
        return Err(AppError::Validation(errors));
    }

    Ok(NewListing {
        title: title.unwrap_or_default(),
        description: trimmed(input.description),
        price: input.price.unwrap_or_default(),
        condition,
        brand: trimmed(input.brand),
        material: trimmed(input.material),
        color: trimmed(input.color),
        dimensions_length_cm: input.dimensions_length_cm,
        dimensions_width_cm: input.dimensions_width_cm,
        dimensions_height_cm: input.dimensions_height_cm,
        sku: trimmed(input.sku).unwrap_or_else(generate_sku),
        cost_price: input.cost_price,
        notes: trimmed(input.notes),
        category: trimmed(input.category),
        image_urls: Vec::new(),
    })
}

/// Same field rules as creation, but every field may be absent.
pub fn validate_changes(input: ListingInput) -> Result<ListingChanges, AppError> {
    let mut errors = Vec::new();
    if let Some(title) = &input.title {
        check_title(title.trim(), &mut errors);
    }
    check_numbers(&input, &mut errors);
    let condition = parse_condition(input.condition.as_deref(), &mut errors);
    let status = match input.status.as_deref().map(str::trim) {
        None => None,
        Some(raw) => match ListingStatus::from_str(raw) {
            Ok(status) => Some(status),
            Err(_) => {
                errors.push(FieldError::new(
                    "status",
                    "Status must be one of draft, active, sold, archived",
                ));
                None
            }
        },
    };
    if !errors.is_empty() {
        return Err(AppError::Validation(errors));
    }

    Ok(ListingChanges {
        title: input.title.map(|t| t.trim().to_string()),
        description: input.description,
        price: input.price,
        condition,
        brand: input.brand,
        material: input.material,
        color: input.color,
        dimensions_length_cm: input.dimensions_length_cm,
        dimensions_width_cm: input.dimensions_width_cm,
        dimensions_height_cm: input.dimensions_height_cm,
        sku: trimmed(input.sku),
        cost_price: input.cost_price,
        notes: input.notes,
        category: input.category,
        status,
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
    pub marketplace: Option<String>,
    pub search: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingsPage {
    pub listings: Vec<Listing>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: i64,
}

pub async fn list(db: &Database, user_id: &str, params: ListParams) -> Result<ListingsPage, AppError> {
    let status = match params.status.as_deref().map(str::trim) {
        None | Some("") | Some("all") => None,
        Some(raw) => Some(ListingStatus::from_str(raw).map_err(|_| AppError::bad_request("Invalid status"))?),
    };
    let marketplace = match params.marketplace.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(Marketplace::from_str(raw).map_err(|_| AppError::bad_request("Invalid marketplace"))?),
    };
    let page = params.page.unwrap_or(1).max(1);
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, 100);
    let result = db
        .list_listings(&ListingQuery {
            user_id: user_id.to_string(),
            status,
            marketplace,
            search: trimmed(params.search),
            page,
            limit,
        })
        .await?;
    let total_pages = (result.total + i64::from(limit) - 1) / i64::from(limit);
    Ok(ListingsPage {
        listings: result.listings,
        total: result.total,
        page,
        limit,
        total_pages,
    })
}

pub async fn get(db: &Database, id: &str, user_id: &str) -> Result<Listing, AppError> {
    db.get_listing(id, user_id)
        .await?
        .ok_or_else(|| AppError::not_found("Listing not found"))
}

pub async fn create(db: &Database, user_id: &str, new: NewListing) -> Result<Listing, AppError> {
    let listing = db.create_listing(user_id, new).await?;
    info!(
        target = "syncsellr.listings",
        user_id,
        listing_id = %listing.id,
        images = listing.images.len(),
        "listing created"
    );
    Ok(listing)
}

/// Applies `changes` and queues a marketplace update for every live API listing.
pub async fn update(
    db: &Database,
    queue: &JobQueue,
    id: &str,
    user_id: &str,
    changes: ListingChanges,
) -> Result<Listing, AppError> {
    if changes.is_empty() {
        return get(db, id, user_id).await;
    }
    let listing = db
        .update_listing(id, user_id, changes)
        .await?
        .ok_or_else(|| AppError::not_found("Listing not found"))?;

    for record in listing.marketplace_listings.iter().filter(|r| needs_remote_update(r)) {
        let job = JobKind::UpdateListing {
            listing_id: listing.id.clone(),
            marketplace: record.marketplace,
            user_id: user_id.to_string(),
        };
        if let Err(err) = queue.enqueue(job, Priority::Normal, Some(user_id.to_string())).await {
            warn!(
                target = "syncsellr.listings",
                listing_id = %listing.id,
                marketplace = %record.marketplace,
                error = %err,
                "could not queue marketplace update"
            );
        }
    }
    Ok(listing)
}

fn needs_remote_update(record: &MarketplaceListing) -> bool {
    record.marketplace.is_api_based()
        && record.status == MarketplaceListingStatus::Active
        && record.external_id.is_some()
}

pub async fn delete(db: &Database, uploads: &UploadStore, id: &str, user_id: &str) -> Result<(), AppError> {
    match db.delete_listing(id, user_id).await? {
        DeleteOutcome::NotFound => Err(AppError::not_found("Listing not found")),
        DeleteOutcome::HasActiveMarketplaceListings => Err(AppError::Conflict(
            "Cannot delete listing with active marketplace listings. Please remove them first.".into(),
        )),
        DeleteOutcome::Deleted(urls) => {
            uploads.remove_all(&urls).await;
            info!(target = "syncsellr.listings", user_id, listing_id = id, "listing deleted");
            Ok(())
        }
    }
}

/// Outcome the browser extension reports after filling a marketplace form.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketplaceStatusReport {
    pub marketplace: String,
    pub success: bool,
    pub external_id: Option<String>,
    pub external_url: Option<String>,
    pub error: Option<String>,
}

pub async fn report_marketplace_status(
    db: &Database,
    id: &str,
    user_id: &str,
    report: MarketplaceStatusReport,
) -> Result<MarketplaceListing, AppError> {
    let marketplace = crate::connections::parse_marketplace(&report.marketplace)?;
    let listing = get(db, id, user_id).await?;
    let update = if report.success {
        MarketplaceListingUpdate {
            status: MarketplaceListingStatus::Active,
            external_id: trimmed(report.external_id),
            external_url: trimmed(report.external_url),
            error_message: None,
            platform_data: None,
            listed_at: Some(Utc::now()),
        }
    } else {
        MarketplaceListingUpdate {
            status: MarketplaceListingStatus::Error,
            external_id: None,
            external_url: None,
            error_message: Some(
                trimmed(report.error).unwrap_or_else(|| "Listing failed".to_string()),
            ),
            platform_data: None,
            listed_at: None,
        }
    };
    let record = db
        .upsert_marketplace_listing(&listing.id, marketplace, update)
        .await?;
    info!(
        target = "syncsellr.listings",
        listing_id = id,
        %marketplace,
        success = report.success,
        "extension reported marketplace status"
    );
    Ok(record)
}

/// Queues a publish job for an API-based marketplace.
pub async fn enqueue_publish(
    db: &Database,
    queue: &JobQueue,
    registry: &MarketplaceRegistry,
    id: &str,
    user_id: &str,
    marketplace: Marketplace,
) -> Result<Uuid, AppError> {
    let name = display_name(marketplace);
    if !marketplace.is_api_based() {
        return Err(AppError::bad_request(format!(
            "{name} listings are created through the browser extension"
        )));
    }
    if !registry.has(marketplace) {
        return Err(AppError::bad_request(format!("{name} integration is not configured")));
    }
    let listing = get(db, id, user_id).await?;
    if listing
        .marketplace_listing(marketplace)
        .is_some_and(|r| r.status == MarketplaceListingStatus::Active)
    {
        return Err(AppError::Conflict(format!("Listing is already published on {name}")));
    }
    let job = JobKind::PublishListing {
        listing_id: listing.id,
        marketplace,
        user_id: user_id.to_string(),
    };
    queue.enqueue(job, Priority::High, Some(user_id.to_string())).await
}

/// Takes a listing down from one marketplace and marks its record ended.
pub async fn remove_from_marketplace(
    db: &Database,
    registry: &MarketplaceRegistry,
    id: &str,
    user_id: &str,
    marketplace: Marketplace,
) -> Result<(), AppError> {
    let listing = get(db, id, user_id).await?;
    let record = listing
        .marketplace_listing(marketplace)
        .filter(|r| !r.status.is_terminal())
        .ok_or_else(|| AppError::not_found(format!("Listing is not on {}", display_name(marketplace))))?;

    if marketplace.is_api_based() && record.external_id.is_some() {
        let adapter = registry
            .get_for_user(marketplace, user_id)
            .await
            .ok_or_else(|| AppError::bad_request(format!("{} integration is not configured", display_name(marketplace))))?;
        adapter.delete_listing(record).await?;
    }
    db.set_marketplace_listing_status(&record.id, MarketplaceListingStatus::Ended)
        .await?;
    info!(target = "syncsellr.listings", listing_id = id, %marketplace, "listing removed from marketplace");
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FillPlanRequest {
    pub platform: String,
    pub html: String,
    pub postcode: Option<String>,
}

/// Plans the extension's form fill against a snapshot of the marketplace page.
pub async fn fill_plan(
    db: &Database,
    selectors: &SelectorRegistry,
    id: &str,
    user_id: &str,
    request: FillPlanRequest,
) -> Result<FillPlan, AppError> {
    let platform = request.platform.trim().to_lowercase();
    if platform.is_empty() {
        return Err(AppError::Validation(vec![FieldError::new("platform", "Platform is required")]));
    }
    if request.html.len() > MAX_SNAPSHOT_BYTES {
        return Err(AppError::PayloadTooLarge);
    }
    let listing = get(db, id, user_id).await?;
    let extras = FillExtras {
        postcode: trimmed(request.postcode),
    };
    let page = StaticPage(request.html);
    Ok(autofill::plan_fill(selectors, &platform, &listing, &extras, &page, Duration::ZERO).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::test_support,
        jobs::{JobFailed, JobHandler, JobOptions},
        marketplace::{ExternalStatus, registry::tests::StubAdapter},
        selectors::MemoryStore,
    };
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Arc;

    struct Idle;

    #[async_trait]
    impl JobHandler for Idle {
        async fn handle(&self, _job: &JobKind) -> Result<Value, JobFailed> {
            Ok(Value::Null)
        }
    }

    fn input(title: &str, price: f64, condition: &str) -> ListingInput {
        ListingInput {
            title: Some(title.into()),
            price: Some(price),
            condition: Some(condition.into()),
            ..ListingInput::default()
        }
    }

    fn etsy_registry() -> MarketplaceRegistry {
        let mut registry = MarketplaceRegistry::new();
        registry.register_factory(Marketplace::Etsy, |user_id| {
            Arc::new(StubAdapter {
                platform: Marketplace::Etsy,
                user_id: user_id.to_string(),
                status: ExternalStatus::Active,
            })
        });
        registry
    }

    #[test]
    fn generated_skus_have_the_expected_shape() {
        let sku = generate_sku();
        let parts: Vec<&str> = sku.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "TF");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 9);
        assert!(parts[2].bytes().all(|b| SKU_ALPHABET.contains(&b)));
        assert_ne!(generate_sku(), sku);
    }

    #[test]
    fn new_listing_validation_collects_field_errors() {
        let err = validate_new(ListingInput {
            title: Some("Oak".into()),
            price: Some(-5.0),
            condition: Some("mint".into()),
            dimensions_width_cm: Some(0.0),
            ..ListingInput::default()
        })
        .expect_err("invalid");
        let AppError::Validation(fields) = err else {
            panic!("expected validation error");
        };
        let names: Vec<&str> = fields.iter().map(|f| f.field.as_str()).collect();
        assert_eq!(names, ["title", "price", "dimensionsWidthCm", "condition"]);

        let err = validate_new(ListingInput::default()).expect_err("empty");
        let AppError::Validation(fields) = err else {
            panic!("expected validation error");
        };
        assert_eq!(fields.len(), 3);
    }

    #[test]
    fn valid_listing_gets_a_generated_sku() {
        let listing = validate_new(input("  Oak sideboard ", 120.0, "used_good")).expect("valid");
        assert_eq!(listing.title, "Oak sideboard");
        assert_eq!(listing.condition, Some(Condition::UsedGood));
        assert!(listing.sku.starts_with("TF-"));

        let mut with_sku = input("Oak sideboard", 120.0, "new");
        with_sku.sku = Some("MY-SKU".into());
        assert_eq!(validate_new(with_sku).expect("valid").sku, "MY-SKU");
    }

    #[test]
    fn partial_updates_only_check_present_fields() {
        let changes = validate_changes(ListingInput {
            price: Some(99.5),
            status: Some("sold".into()),
            ..ListingInput::default()
        })
        .expect("valid");
        assert_eq!(changes.price, Some(99.5));
        assert_eq!(changes.status, Some(ListingStatus::Sold));
        assert!(changes.title.is_none());

        assert!(validate_changes(ListingInput {
            status: Some("gone".into()),
            ..ListingInput::default()
        })
        .is_err());
        assert!(validate_changes(ListingInput::default()).expect("empty").is_empty());
    }

    #[tokio::test]
    async fn list_reports_pages_and_rejects_unknown_filters() {
        let db = test_support::database().await;
        let owner = test_support::user(&db, "seller@example.com").await;
        for n in 0..3 {
            let new = validate_new(input(&format!("Pine chair {n}"), 40.0, "used_fair")).expect("valid");
            create(&db, &owner.id, new).await.expect("create");
        }
        let page = list(
            &db,
            &owner.id,
            ListParams {
                status: Some("all".into()),
                limit: Some(2),
                ..ListParams::default()
            },
        )
        .await
        .expect("list");
        assert_eq!(page.total, 3);
        assert_eq!(page.total_pages, 2);
        assert_eq!(page.listings.len(), 2);

        let err = list(
            &db,
            &owner.id,
            ListParams {
                marketplace: Some("craigslist".into()),
                ..ListParams::default()
            },
        )
        .await
        .expect_err("bad filter");
        assert_eq!(err.to_string(), "Invalid marketplace");
    }

    #[tokio::test]
    async fn extension_reports_upsert_records() {
        let db = test_support::database().await;
        let owner = test_support::user(&db, "seller@example.com").await;
        let listing = create(&db, &owner.id, validate_new(input("Oak sideboard", 120.0, "new")).expect("valid"))
            .await
            .expect("create");

        let failed = report_marketplace_status(
            &db,
            &listing.id,
            &owner.id,
            MarketplaceStatusReport {
                marketplace: "vinted".into(),
                success: false,
                external_id: None,
                external_url: None,
                error: None,
            },
        )
        .await
        .expect("report");
        assert_eq!(failed.status, MarketplaceListingStatus::Error);
        assert_eq!(failed.error_message.as_deref(), Some("Listing failed"));

        let live = report_marketplace_status(
            &db,
            &listing.id,
            &owner.id,
            MarketplaceStatusReport {
                marketplace: "vinted".into(),
                success: true,
                external_id: Some("v-1".into()),
                external_url: Some("https://vinted.test/items/v-1".into()),
                error: None,
            },
        )
        .await
        .expect("report");
        assert_eq!(live.status, MarketplaceListingStatus::Active);
        assert!(live.error_message.is_none());
        assert!(live.listed_at.is_some());

        let uploads = UploadStore::new(std::env::temp_dir());
        let err = delete(&db, &uploads, &listing.id, &owner.id).await.expect_err("active");
        assert_eq!(err.status(), axum::http::StatusCode::CONFLICT);

        let registry = MarketplaceRegistry::new();
        remove_from_marketplace(&db, &registry, &listing.id, &owner.id, Marketplace::Vinted)
            .await
            .expect("remove");
        delete(&db, &uploads, &listing.id, &owner.id).await.expect("delete");
        assert!(db.get_listing_any(&listing.id).await.expect("query").is_none());
    }

    #[tokio::test]
    async fn publish_is_limited_to_api_marketplaces() {
        let db = test_support::database().await;
        let owner = test_support::user(&db, "seller@example.com").await;
        let listing = create(&db, &owner.id, validate_new(input("Oak sideboard", 120.0, "new")).expect("valid"))
            .await
            .expect("create");
        let queue = JobQueue::spawn(Arc::new(Idle), JobOptions::default());
        let registry = etsy_registry();

        let err = enqueue_publish(&db, &queue, &registry, &listing.id, &owner.id, Marketplace::Depop)
            .await
            .expect_err("extension marketplace");
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);

        let err = enqueue_publish(&db, &queue, &registry, &listing.id, &owner.id, Marketplace::Ebay)
            .await
            .expect_err("not configured");
        assert_eq!(err.to_string(), "eBay integration is not configured");

        let err = enqueue_publish(&db, &queue, &registry, &listing.id, "intruder", Marketplace::Etsy)
            .await
            .expect_err("not owner");
        assert_eq!(err.to_string(), "Listing not found");

        let id = enqueue_publish(&db, &queue, &registry, &listing.id, &owner.id, Marketplace::Etsy)
            .await
            .expect("queued");
        let info = queue.get(id).await.expect("job");
        assert_eq!(info.owner.as_deref(), Some(owner.id.as_str()));
        queue.close().await;
    }

    #[tokio::test]
    async fn updates_queue_jobs_for_live_api_listings() {
        let db = test_support::database().await;
        let owner = test_support::user(&db, "seller@example.com").await;
        let listing = create(&db, &owner.id, validate_new(input("Oak sideboard", 120.0, "new")).expect("valid"))
            .await
            .expect("create");
        db.upsert_marketplace_listing(
            &listing.id,
            Marketplace::Etsy,
            MarketplaceListingUpdate {
                status: MarketplaceListingStatus::Active,
                external_id: Some("555".into()),
                external_url: None,
                error_message: None,
                platform_data: None,
                listed_at: Some(Utc::now()),
            },
        )
        .await
        .expect("record");
        let queue = JobQueue::spawn(Arc::new(Idle), JobOptions { concurrency: 1, ..JobOptions::default() });
        queue.close().await;

        // A closed queue refuses the job but the edit itself still lands.
        let updated = update(
            &db,
            &queue,
            &listing.id,
            &owner.id,
            validate_changes(ListingInput {
                title: Some("Oak sideboard, restored".into()),
                ..ListingInput::default()
            })
            .expect("valid"),
        )
        .await
        .expect("update");
        assert_eq!(updated.title, "Oak sideboard, restored");
    }

    #[tokio::test]
    async fn fill_plan_uses_the_listing() {
        let db = test_support::database().await;
        let owner = test_support::user(&db, "seller@example.com").await;
        let listing = create(&db, &owner.id, validate_new(input("Oak sideboard", 120.0, "new")).expect("valid"))
            .await
            .expect("create");
        let selectors = SelectorRegistry::init(Arc::new(MemoryStore::default())).await;
        let plan = fill_plan(
            &db,
            &selectors,
            &listing.id,
            &owner.id,
            FillPlanRequest {
                platform: "Gumtree".into(),
                html: r#"<input name="title"><input name="postcode">"#.into(),
                postcode: Some("SW1A 1AA".into()),
            },
        )
        .await
        .expect("plan");
        assert!(plan.ready);
        assert_eq!(plan.platform, "gumtree");
        let title = plan.steps.iter().find(|s| s.key == "titleInput").expect("title");
        assert_eq!(title.value, "Oak sideboard");
    }
}
