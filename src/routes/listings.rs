use super::AppState;
use crate::{
    auth::AuthUser,
    autofill::FillPlan,
    connections::parse_marketplace,
    error::{AppError, FieldError},
    idempotency,
    listings::{self, FillPlanRequest, ListParams, ListingInput, ListingsPage, MarketplaceStatusReport},
    metrics,
    models::{Listing, MarketplaceListing},
    security::sanitize_text,
    selectors::SNAPSHOT_BODY_LIMIT,
    uploads::{MAX_FILE_BYTES, MAX_FILES, UploadError, UploadStore},
};
use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::{
        DefaultBodyLimit, FromRequest, Multipart, Path, Query, Request, State,
        multipart::MultipartError, rejection::JsonRejection, rejection::QueryRejection,
    },
    http::{StatusCode, header},
    routing::{delete, get, post},
};
use serde_json::{Value, json};
use tracing::warn;

/// Every image at full size plus room for the text fields.
const CREATE_BODY_LIMIT: usize = MAX_FILES * MAX_FILE_BYTES + 1024 * 1024;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/",
            get(list).post(create).layer(DefaultBodyLimit::max(CREATE_BODY_LIMIT)),
        )
        .route("/{id}", get(show).put(update).delete(destroy))
        .route("/{id}/marketplace-status", post(report_status))
        .route("/{id}/publish/{marketplace}", post(publish))
        .route("/{id}/marketplaces/{marketplace}", delete(remove_from_marketplace))
        .route(
            "/{id}/fill-plan",
            post(fill_plan).layer(DefaultBodyLimit::max(SNAPSHOT_BODY_LIMIT)),
        )
}

fn upload_error(err: UploadError) -> AppError {
    match err {
        UploadError::Io(err) => AppError::internal(format!("upload write: {err}")),
        other => AppError::bad_request(other.to_string()),
    }
}

fn multipart_error(err: MultipartError) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return AppError::PayloadTooLarge;
    }
    AppError::bad_request(err.body_text())
}

fn form_number(field: &str, raw: &str, errors: &mut Vec<FieldError>) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse::<f64>() {
        Ok(value) => Some(value),
        Err(_) => {
            errors.push(FieldError::new(field, "Expected a number"));
            None
        }
    }
}

fn set_form_field(input: &mut ListingInput, name: &str, value: String, errors: &mut Vec<FieldError>) {
    let text = Some(value.clone()).filter(|v| !v.trim().is_empty());
    match name {
        "title" => input.title = Some(value),
        "description" => input.description = text,
        "condition" => input.condition = text,
        "brand" => input.brand = text,
        "material" => input.material = text,
        "color" => input.color = text,
        "sku" => input.sku = text,
        "notes" => input.notes = text,
        "category" => input.category = text,
        "price" => input.price = form_number(name, &value, errors),
        "costPrice" => input.cost_price = form_number(name, &value, errors),
        "dimensionsLengthCm" => input.dimensions_length_cm = form_number(name, &value, errors),
        "dimensionsWidthCm" => input.dimensions_width_cm = form_number(name, &value, errors),
        "dimensionsHeightCm" => input.dimensions_height_cm = form_number(name, &value, errors),
        _ => {}
    }
}

struct ListingForm {
    input: ListingInput,
    images: Vec<(String, Bytes)>,
}

/// Reads every part before anything is written, so a bad file stores nothing.
async fn read_form(mut multipart: Multipart) -> Result<ListingForm, AppError> {
    let mut input = ListingInput::default();
    let mut images = Vec::new();
    let mut errors = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "images" {
            if images.len() == MAX_FILES {
                return Err(upload_error(UploadError::TooMany));
            }
            let content_type = field.content_type().unwrap_or_default().to_string();
            let bytes = field.bytes().await.map_err(multipart_error)?;
            UploadStore::validate(&content_type, bytes.len()).map_err(upload_error)?;
            images.push((content_type, bytes));
            continue;
        }
        let value = field.text().await.map_err(multipart_error)?;
        set_form_field(&mut input, &name, sanitize_text(&value), &mut errors);
    }
    if !errors.is_empty() {
        return Err(AppError::Validation(errors));
    }
    Ok(ListingForm { input, images })
}

async fn store_images(uploads: &UploadStore, images: &[(String, Bytes)]) -> Result<Vec<String>, AppError> {
    let mut urls = Vec::with_capacity(images.len());
    for (content_type, bytes) in images {
        match uploads.save(content_type, bytes).await {
            Ok(url) => urls.push(url),
            Err(err) => {
                uploads.remove_all(&urls).await;
                return Err(upload_error(err));
            }
        }
    }
    Ok(urls)
}

/// List the caller's listings.
///
/// - Method: `GET`
/// - Path: `/api/listings`
/// - Query: `status`, `marketplace`, `search`, `page`, `limit`
async fn list(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<ListingsPage>, AppError> {
    metrics::inc_requests("/api/listings");
    let Query(params) = params.map_err(|err| AppError::bad_request(err.body_text()))?;
    Ok(Json(listings::list(&state.db, &user.user_id, params).await?))
}

/// Create a listing from a multipart form (with `images`) or a JSON body.
///
/// - Method: `POST`
/// - Path: `/api/listings`
/// - Headers: optional `Idempotency-Key`
/// - Response: `201` with the listing
async fn create(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    request: Request,
) -> Result<(StatusCode, Json<Value>), AppError> {
    metrics::inc_requests("/api/listings:create");
    let key = idempotency::normalize_key(
        request
            .headers()
            .get(idempotency::HEADER)
            .and_then(|v| v.to_str().ok()),
    );
    if let Some(key) = &key
        && let Some(replay) = state.idempotency.lookup(&user.user_id, key).await
    {
        let status = StatusCode::from_u16(replay.status).unwrap_or(StatusCode::CREATED);
        return Ok((status, Json(replay.body)));
    }

    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/form-data"));
    let form = if is_multipart {
        let multipart = Multipart::from_request(request, &state)
            .await
            .map_err(|err| AppError::bad_request(err.body_text()))?;
        read_form(multipart).await?
    } else {
        let Json(input) = Json::<ListingInput>::from_request(request, &state)
            .await
            .map_err(AppError::from)?;
        ListingForm {
            input,
            images: Vec::new(),
        }
    };

    let mut new = listings::validate_new(form.input)?;
    new.image_urls = store_images(&state.uploads, &form.images).await?;
    let listing = match listings::create(&state.db, &user.user_id, new.clone()).await {
        Ok(listing) => listing,
        Err(err) => {
            state.uploads.remove_all(&new.image_urls).await;
            return Err(err);
        }
    };

    let body = serde_json::to_value(&listing)
        .map_err(|err| AppError::internal(format!("encode listing: {err}")))?;
    if let Some(key) = &key {
        state
            .idempotency
            .remember(&user.user_id, key, StatusCode::CREATED.as_u16(), &body)
            .await;
    }
    Ok((StatusCode::CREATED, Json(body)))
}

async fn show(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<Listing>, AppError> {
    Ok(Json(listings::get(&state.db, &id, &user.user_id).await?))
}

/// Partial update. Live eBay and Etsy copies are refreshed through the job queue.
///
/// - Method: `PUT`
/// - Path: `/api/listings/{id}`
async fn update(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    payload: Result<Json<ListingInput>, JsonRejection>,
) -> Result<Json<Listing>, AppError> {
    metrics::inc_requests("/api/listings:update");
    let Json(input) = payload?;
    let changes = listings::validate_changes(input)?;
    Ok(Json(
        listings::update(&state.db, &state.queue, &id, &user.user_id, changes).await?,
    ))
}

async fn destroy(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/api/listings:delete");
    listings::delete(&state.db, &state.uploads, &id, &user.user_id).await?;
    Ok(Json(json!({ "success": true })))
}

/// Outcome reported by the browser extension after it filled a marketplace form.
///
/// - Method: `POST`
/// - Path: `/api/listings/{id}/marketplace-status`
/// - Body: `{ marketplace, success, externalId?, externalUrl?, error? }`
async fn report_status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    payload: Result<Json<MarketplaceStatusReport>, JsonRejection>,
) -> Result<Json<MarketplaceListing>, AppError> {
    metrics::inc_requests("/api/listings/marketplace-status");
    let Json(report) = payload?;
    Ok(Json(
        listings::report_marketplace_status(&state.db, &id, &user.user_id, report).await?,
    ))
}

/// Queue an API publish.
///
/// - Method: `POST`
/// - Path: `/api/listings/{id}/publish/{marketplace}`
/// - Response: `202` with `{ jobId }`
async fn publish(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path((id, marketplace)): Path<(String, String)>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    metrics::inc_requests("/api/listings/publish");
    let marketplace = parse_marketplace(&marketplace)?;
    let job_id = listings::enqueue_publish(
        &state.db,
        &state.queue,
        &state.marketplaces,
        &id,
        &user.user_id,
        marketplace,
    )
    .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "jobId": job_id.to_string(), "status": "queued" })),
    ))
}

async fn remove_from_marketplace(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path((id, marketplace)): Path<(String, String)>,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/api/listings/marketplaces:delete");
    let marketplace = parse_marketplace(&marketplace)?;
    listings::remove_from_marketplace(&state.db, &state.marketplaces, &id, &user.user_id, marketplace)
        .await
        .inspect_err(|err| {
            warn!(target = "syncsellr.api", listing_id = %id, %marketplace, error = %err, "marketplace removal failed")
        })?;
    Ok(Json(json!({ "success": true })))
}

/// - Method: `POST`
/// - Path: `/api/listings/{id}/fill-plan`
/// - Body: `{ platform, html, postcode? }`
async fn fill_plan(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    payload: Result<Json<FillPlanRequest>, JsonRejection>,
) -> Result<Json<FillPlan>, AppError> {
    metrics::inc_requests("/api/listings/fill-plan");
    let Json(request) = payload?;
    Ok(Json(
        listings::fill_plan(&state.db, &state.selectors, &id, &user.user_id, request).await?,
    ))
}
