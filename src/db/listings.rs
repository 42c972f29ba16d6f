use super::{Database, json_column, new_id, now, optional_text_column, text_column};
use crate::models::{
    Condition, Listing, ListingImage, ListingStatus, Marketplace, MarketplaceListing,
    MarketplaceListingStatus,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{QueryBuilder, Row, Sqlite, sqlite::SqliteRow};
use std::collections::HashMap;

const LISTING_COLUMNS: &str = "id, user_id, title, description, price, condition, brand, \
     material, color, dimensions_length_cm, dimensions_width_cm, dimensions_height_cm, sku, \
     cost_price, notes, category, status, created_at, updated_at";

const MARKETPLACE_LISTING_COLUMNS: &str = "id, listing_id, marketplace, status, external_id, \
     external_url, error_message, platform_data, listed_at, ended_at, created_at, updated_at";

#[derive(Debug, Clone, Default)]
pub struct NewListing {
    pub title: String,
    pub description: Option<String>,
    pub price: f64,
    pub condition: Option<Condition>,
    pub brand: Option<String>,
    pub material: Option<String>,
    pub color: Option<String>,
    pub dimensions_length_cm: Option<f64>,
    pub dimensions_width_cm: Option<f64>,
    pub dimensions_height_cm: Option<f64>,
    pub sku: String,
    pub cost_price: Option<f64>,
    pub notes: Option<String>,
    pub category: Option<String>,
    pub image_urls: Vec<String>,
}

/// Partial update. `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct ListingChanges {
    pub title: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub condition: Option<Condition>,
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
    pub status: Option<ListingStatus>,
}

impl ListingChanges {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.price.is_none()
            && self.condition.is_none()
            && self.brand.is_none()
            && self.material.is_none()
            && self.color.is_none()
            && self.dimensions_length_cm.is_none()
            && self.dimensions_width_cm.is_none()
            && self.dimensions_height_cm.is_none()
            && self.sku.is_none()
            && self.cost_price.is_none()
            && self.notes.is_none()
            && self.category.is_none()
            && self.status.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct ListingQuery {
    pub user_id: String,
    pub status: Option<ListingStatus>,
    pub marketplace: Option<Marketplace>,
    pub search: Option<String>,
    pub page: u32,
    pub limit: u32,
}

#[derive(Debug)]
pub struct ListingPage {
    pub listings: Vec<Listing>,
    pub total: i64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    NotFound,
    HasActiveMarketplaceListings,
    /// Carries the image URLs so their files can be removed.
    Deleted(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct MarketplaceListingUpdate {
    pub status: MarketplaceListingStatus,
    pub external_id: Option<String>,
    pub external_url: Option<String>,
    pub error_message: Option<String>,
    pub platform_data: Option<Value>,
    pub listed_at: Option<DateTime<Utc>>,
}

/// An active marketplace listing with the state of its parent listing.
#[derive(Debug, Clone)]
pub struct SyncCandidate {
    pub record: MarketplaceListing,
    pub owner_id: Option<String>,
    pub listing_status: Option<ListingStatus>,
}

fn listing_from_row(row: &SqliteRow) -> Result<Listing, sqlx::Error> {
    Ok(Listing {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        price: row.try_get("price")?,
        condition: optional_text_column(row, "condition")?,
        brand: row.try_get("brand")?,
        material: row.try_get("material")?,
        color: row.try_get("color")?,
        dimensions_length_cm: row.try_get("dimensions_length_cm")?,
        dimensions_width_cm: row.try_get("dimensions_width_cm")?,
        dimensions_height_cm: row.try_get("dimensions_height_cm")?,
        sku: row.try_get("sku")?,
        cost_price: row.try_get("cost_price")?,
        notes: row.try_get("notes")?,
        category: row.try_get("category")?,
        status: text_column(row, "status")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        images: Vec::new(),
        marketplace_listings: Vec::new(),
    })
}

fn image_from_row(row: &SqliteRow) -> Result<ListingImage, sqlx::Error> {
    Ok(ListingImage {
        id: row.try_get("id")?,
        listing_id: row.try_get("listing_id")?,
        url: row.try_get("url")?,
        position: row.try_get("position")?,
        created_at: row.try_get("created_at")?,
    })
}

fn marketplace_listing_from_row(row: &SqliteRow) -> Result<MarketplaceListing, sqlx::Error> {
    Ok(MarketplaceListing {
        id: row.try_get("id")?,
        listing_id: row.try_get("listing_id")?,
        marketplace: text_column(row, "marketplace")?,
        status: text_column(row, "status")?,
        external_id: row.try_get("external_id")?,
        external_url: row.try_get("external_url")?,
        error_message: row.try_get("error_message")?,
        platform_data: json_column(row, "platform_data")?,
        listed_at: row.try_get("listed_at")?,
        ended_at: row.try_get("ended_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, query: &ListingQuery) {
    builder.push(" WHERE user_id = ");
    builder.push_bind(query.user_id.clone());
    if let Some(status) = query.status {
        builder.push(" AND status = ");
        builder.push_bind(status.as_str());
    }
    if let Some(marketplace) = query.marketplace {
        builder.push(
            " AND EXISTS (SELECT 1 FROM marketplace_listings ml \
             WHERE ml.listing_id = listings.id AND ml.marketplace = ",
        );
        builder.push_bind(marketplace.as_str());
        builder.push(")");
    }
    if let Some(search) = query.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        builder.push(" AND title LIKE ");
        builder.push_bind(format!("%{}%", escape_like(search)));
        builder.push(" ESCAPE '\\'");
    }
}

fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

impl Database {
    pub async fn list_listings(&self, query: &ListingQuery) -> Result<ListingPage, sqlx::Error> {
        let limit = query.limit.clamp(1, 100);
        let page = query.page.max(1);

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM listings");
        push_filters(&mut count, query);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<Sqlite>::new(format!("SELECT {LISTING_COLUMNS} FROM listings"));
        push_filters(&mut select, query);
        select.push(" ORDER BY created_at DESC, rowid DESC LIMIT ");
        select.push_bind(i64::from(limit));
        select.push(" OFFSET ");
        select.push_bind(i64::from(page - 1) * i64::from(limit));

        let rows = select.build().fetch_all(&self.pool).await?;
        let mut listings = rows
            .iter()
            .map(listing_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        self.attach_children(&mut listings).await?;
        Ok(ListingPage { listings, total })
    }

    /// Loads a listing only if `user_id` owns it.
    pub async fn get_listing(&self, id: &str, user_id: &str) -> Result<Option<Listing>, sqlx::Error> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM listings WHERE id = ? AND user_id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        self.with_children(row).await
    }

    pub async fn get_listing_any(&self, id: &str) -> Result<Option<Listing>, sqlx::Error> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM listings WHERE id = ?");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        self.with_children(row).await
    }

    async fn with_children(&self, row: Option<SqliteRow>) -> Result<Option<Listing>, sqlx::Error> {
        let Some(row) = row else {
            return Ok(None);
        };
        let mut listings = vec![listing_from_row(&row)?];
        self.attach_children(&mut listings).await?;
        Ok(listings.pop())
    }

    async fn attach_children(&self, listings: &mut [Listing]) -> Result<(), sqlx::Error> {
        if listings.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = listings.iter().map(|l| l.id.clone()).collect();

        let mut images = QueryBuilder::<Sqlite>::new(
            "SELECT id, listing_id, url, position, created_at FROM listing_images WHERE listing_id IN (",
        );
        let mut separated = images.separated(", ");
        for id in &ids {
            separated.push_bind(id.clone());
        }
        images.push(") ORDER BY position ASC");
        let mut images_by_listing: HashMap<String, Vec<ListingImage>> = HashMap::new();
        for row in images.build().fetch_all(&self.pool).await? {
            let image = image_from_row(&row)?;
            images_by_listing
                .entry(image.listing_id.clone())
                .or_default()
                .push(image);
        }

        let mut records = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {MARKETPLACE_LISTING_COLUMNS} FROM marketplace_listings WHERE listing_id IN ("
        ));
        let mut separated = records.separated(", ");
        for id in &ids {
            separated.push_bind(id.clone());
        }
        records.push(") ORDER BY created_at ASC");
        let mut records_by_listing: HashMap<String, Vec<MarketplaceListing>> = HashMap::new();
        for row in records.build().fetch_all(&self.pool).await? {
            let record = marketplace_listing_from_row(&row)?;
            records_by_listing
                .entry(record.listing_id.clone())
                .or_default()
                .push(record);
        }

        for listing in listings.iter_mut() {
            listing.images = images_by_listing.remove(&listing.id).unwrap_or_default();
            listing.marketplace_listings =
                records_by_listing.remove(&listing.id).unwrap_or_default();
        }
        Ok(())
    }

    pub async fn create_listing(&self, user_id: &str, new: NewListing) -> Result<Listing, sqlx::Error> {
        let id = new_id();
        let ts = now();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO listings (id, user_id, title, description, price, condition, brand, material,
                color, dimensions_length_cm, dimensions_width_cm, dimensions_height_cm, sku,
                cost_price, notes, category, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'draft', ?, ?)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(&new.title)
        .bind(&new.description)
        .bind(new.price)
        .bind(new.condition.map(|c| c.as_str()))
        .bind(&new.brand)
        .bind(&new.material)
        .bind(&new.color)
        .bind(new.dimensions_length_cm)
        .bind(new.dimensions_width_cm)
        .bind(new.dimensions_height_cm)
        .bind(&new.sku)
        .bind(new.cost_price)
        .bind(&new.notes)
        .bind(&new.category)
        .bind(ts)
        .bind(ts)
        .execute(&mut *tx)
        .await?;

        for (position, url) in new.image_urls.iter().enumerate() {
            sqlx::query(
                "INSERT INTO listing_images (id, listing_id, url, position, created_at)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(new_id())
            .bind(&id)
            .bind(url)
            .bind(position as i64)
            .bind(ts)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.get_listing(&id, user_id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn update_listing(
        &self,
        id: &str,
        user_id: &str,
        changes: ListingChanges,
    ) -> Result<Option<Listing>, sqlx::Error> {
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE listings SET updated_at = ");
        builder.push_bind(now());

        macro_rules! set {
            ($column:literal, $value:expr) => {
                if let Some(value) = $value {
                    builder.push(concat!(", ", $column, " = "));
                    builder.push_bind(value);
                }
            };
        }
        set!("title", changes.title);
        set!("description", changes.description);
        set!("price", changes.price);
        set!("condition", changes.condition.map(|c| c.as_str()));
        set!("brand", changes.brand);
        set!("material", changes.material);
        set!("color", changes.color);
        set!("dimensions_length_cm", changes.dimensions_length_cm);
        set!("dimensions_width_cm", changes.dimensions_width_cm);
        set!("dimensions_height_cm", changes.dimensions_height_cm);
        set!("sku", changes.sku);
        set!("cost_price", changes.cost_price);
        set!("notes", changes.notes);
        set!("category", changes.category);
        set!("status", changes.status.map(|s| s.as_str()));

        builder.push(" WHERE id = ");
        builder.push_bind(id.to_string());
        builder.push(" AND user_id = ");
        builder.push_bind(user_id.to_string());

        let result = builder.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_listing(id, user_id).await
    }

    pub async fn delete_listing(&self, id: &str, user_id: &str) -> Result<DeleteOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let exists: Option<String> =
            sqlx::query_scalar("SELECT id FROM listings WHERE id = ? AND user_id = ?")
                .bind(id)
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Ok(DeleteOutcome::NotFound);
        }

        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM marketplace_listings WHERE listing_id = ? AND status = 'active'",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        if active > 0 {
            return Ok(DeleteOutcome::HasActiveMarketplaceListings);
        }

        let urls: Vec<String> =
            sqlx::query_scalar("SELECT url FROM listing_images WHERE listing_id = ? ORDER BY position")
                .bind(id)
                .fetch_all(&mut *tx)
                .await?;
        sqlx::query("DELETE FROM marketplace_listings WHERE listing_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM listing_images WHERE listing_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM listings WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(DeleteOutcome::Deleted(urls))
    }

    /// Inserts or replaces the record for `(listing_id, marketplace)`.
    pub async fn upsert_marketplace_listing(
        &self,
        listing_id: &str,
        marketplace: Marketplace,
        update: MarketplaceListingUpdate,
    ) -> Result<MarketplaceListing, sqlx::Error> {
        let ts = now();
        let platform_data = update.platform_data.as_ref().map(Value::to_string);
        sqlx::query(
            "INSERT INTO marketplace_listings (id, listing_id, marketplace, status, external_id,
                external_url, error_message, platform_data, listed_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (listing_id, marketplace) DO UPDATE SET
                status = excluded.status,
                external_id = COALESCE(excluded.external_id, marketplace_listings.external_id),
                external_url = COALESCE(excluded.external_url, marketplace_listings.external_url),
                error_message = excluded.error_message,
                platform_data = COALESCE(excluded.platform_data, marketplace_listings.platform_data),
                listed_at = COALESCE(excluded.listed_at, marketplace_listings.listed_at),
                updated_at = excluded.updated_at",
        )
        .bind(new_id())
        .bind(listing_id)
        .bind(marketplace.as_str())
        .bind(update.status.as_str())
        .bind(&update.external_id)
        .bind(&update.external_url)
        .bind(&update.error_message)
        .bind(platform_data)
        .bind(update.listed_at)
        .bind(ts)
        .bind(ts)
        .execute(&self.pool)
        .await?;

        let sql = format!(
            "SELECT {MARKETPLACE_LISTING_COLUMNS} FROM marketplace_listings
             WHERE listing_id = ? AND marketplace = ?"
        );
        let row = sqlx::query(&sql)
            .bind(listing_id)
            .bind(marketplace.as_str())
            .fetch_one(&self.pool)
            .await?;
        marketplace_listing_from_row(&row)
    }

    /// Next page of active marketplace listings that carry an external id,
    /// ordered by id and starting after `cursor`.
    pub async fn active_marketplace_listings(
        &self,
        user_id: Option<&str>,
        cursor: Option<&str>,
        batch: u32,
    ) -> Result<Vec<SyncCandidate>, sqlx::Error> {
        let columns = MARKETPLACE_LISTING_COLUMNS
            .split(", ")
            .map(|c| format!("ml.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {columns}, l.user_id AS owner_id, l.status AS listing_status
             FROM marketplace_listings ml
             LEFT JOIN listings l ON l.id = ml.listing_id
             WHERE ml.status = 'active' AND ml.external_id IS NOT NULL"
        ));
        if let Some(user_id) = user_id {
            builder.push(" AND l.user_id = ");
            builder.push_bind(user_id.to_string());
        }
        if let Some(cursor) = cursor {
            builder.push(" AND ml.id > ");
            builder.push_bind(cursor.to_string());
        }
        builder.push(" ORDER BY ml.id ASC LIMIT ");
        builder.push_bind(i64::from(batch));

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok::<_, sqlx::Error>(SyncCandidate {
                    record: marketplace_listing_from_row(row)?,
                    owner_id: row.try_get("owner_id")?,
                    listing_status: optional_text_column(row, "listing_status")?,
                })
            })
            .collect()
    }

    pub async fn set_marketplace_listing_status(
        &self,
        id: &str,
        status: MarketplaceListingStatus,
    ) -> Result<(), sqlx::Error> {
        let ts = now();
        let ended_at = status.is_terminal().then_some(ts);
        sqlx::query(
            "UPDATE marketplace_listings
             SET status = ?, ended_at = COALESCE(?, ended_at), updated_at = ?
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(ended_at)
        .bind(ts)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{database, user};

    fn sample(title: &str) -> NewListing {
        NewListing {
            title: title.to_string(),
            price: 120.0,
            condition: Some(Condition::UsedGood),
            sku: format!("TF-{title}"),
            image_urls: vec!["/uploads/a.jpg".into(), "/uploads/b.png".into()],
            ..NewListing::default()
        }
    }

    fn query(user_id: &str) -> ListingQuery {
        ListingQuery {
            user_id: user_id.to_string(),
            status: None,
            marketplace: None,
            search: None,
            page: 1,
            limit: 20,
        }
    }

    #[tokio::test]
    async fn create_records_images_in_order() {
        let db = database().await;
        let owner = user(&db, "owner@example.com").await;
        let listing = db.create_listing(&owner.id, sample("Oak desk")).await.expect("create");
        assert_eq!(listing.status, ListingStatus::Draft);
        assert_eq!(listing.images.len(), 2);
        assert_eq!(listing.images[0].url, "/uploads/a.jpg");
        assert_eq!(listing.images[1].position, 1);
        assert!(listing.marketplace_listings.is_empty());
    }

    #[tokio::test]
    async fn listing_is_scoped_to_owner() {
        let db = database().await;
        let owner = user(&db, "owner@example.com").await;
        let other = user(&db, "other@example.com").await;
        let listing = db.create_listing(&owner.id, sample("Oak desk")).await.expect("create");
        assert!(db.get_listing(&listing.id, &other.id).await.expect("query").is_none());
        assert!(db.get_listing(&listing.id, &owner.id).await.expect("query").is_some());
        assert_eq!(
            db.delete_listing(&listing.id, &other.id).await.expect("delete"),
            DeleteOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn list_filters_and_paginates() {
        let db = database().await;
        let owner = user(&db, "owner@example.com").await;
        for title in ["Oak desk", "Pine chair", "Oak wardrobe"] {
            db.create_listing(&owner.id, sample(title)).await.expect("create");
        }

        let mut q = query(&owner.id);
        q.search = Some("oak".into());
        let page = db.list_listings(&q).await.expect("list");
        assert_eq!(page.total, 2);
        assert_eq!(page.listings[0].title, "Oak wardrobe");

        let mut q = query(&owner.id);
        q.limit = 2;
        q.page = 2;
        let page = db.list_listings(&q).await.expect("list");
        assert_eq!(page.total, 3);
        assert_eq!(page.listings.len(), 1);
        assert_eq!(page.listings[0].title, "Oak desk");

        let mut q = query(&owner.id);
        q.status = Some(ListingStatus::Sold);
        assert_eq!(db.list_listings(&q).await.expect("list").total, 0);
    }

    #[tokio::test]
    async fn search_treats_wildcards_literally() {
        let db = database().await;
        let owner = user(&db, "owner@example.com").await;
        db.create_listing(&owner.id, sample("Oak desk")).await.expect("create");
        let mut q = query(&owner.id);
        q.search = Some("%".into());
        assert_eq!(db.list_listings(&q).await.expect("list").total, 0);
    }

    #[tokio::test]
    async fn marketplace_filter_matches_existing_records() {
        let db = database().await;
        let owner = user(&db, "owner@example.com").await;
        let desk = db.create_listing(&owner.id, sample("Oak desk")).await.expect("create");
        db.create_listing(&owner.id, sample("Pine chair")).await.expect("create");
        db.upsert_marketplace_listing(
            &desk.id,
            Marketplace::Vinted,
            MarketplaceListingUpdate {
                status: MarketplaceListingStatus::Active,
                external_id: Some("v-1".into()),
                external_url: None,
                error_message: None,
                platform_data: None,
                listed_at: Some(Utc::now()),
            },
        )
        .await
        .expect("upsert");

        let mut q = query(&owner.id);
        q.marketplace = Some(Marketplace::Vinted);
        let page = db.list_listings(&q).await.expect("list");
        assert_eq!(page.total, 1);
        assert_eq!(page.listings[0].id, desk.id);
        assert_eq!(page.listings[0].marketplace_listings.len(), 1);
    }

    #[tokio::test]
    async fn partial_update_touches_only_given_fields() {
        let db = database().await;
        let owner = user(&db, "owner@example.com").await;
        let listing = db.create_listing(&owner.id, sample("Oak desk")).await.expect("create");
        let updated = db
            .update_listing(
                &listing.id,
                &owner.id,
                ListingChanges {
                    price: Some(99.5),
                    brand: Some("Ercol".into()),
                    ..ListingChanges::default()
                },
            )
            .await
            .expect("update")
            .expect("found");
        assert_eq!(updated.price, 99.5);
        assert_eq!(updated.brand.as_deref(), Some("Ercol"));
        assert_eq!(updated.title, "Oak desk");
        assert_eq!(updated.condition, Some(Condition::UsedGood));
    }

    #[tokio::test]
    async fn delete_refused_while_marketplace_listing_active() {
        let db = database().await;
        let owner = user(&db, "owner@example.com").await;
        let listing = db.create_listing(&owner.id, sample("Oak desk")).await.expect("create");
        let record = db
            .upsert_marketplace_listing(
                &listing.id,
                Marketplace::Ebay,
                MarketplaceListingUpdate {
                    status: MarketplaceListingStatus::Active,
                    external_id: Some("1234".into()),
                    external_url: None,
                    error_message: None,
                    platform_data: Some(serde_json::json!({"sku": "TF-1"})),
                    listed_at: Some(Utc::now()),
                },
            )
            .await
            .expect("upsert");
        assert_eq!(
            db.delete_listing(&listing.id, &owner.id).await.expect("delete"),
            DeleteOutcome::HasActiveMarketplaceListings
        );

        db.set_marketplace_listing_status(&record.id, MarketplaceListingStatus::Ended)
            .await
            .expect("status");
        match db.delete_listing(&listing.id, &owner.id).await.expect("delete") {
            DeleteOutcome::Deleted(urls) => assert_eq!(urls.len(), 2),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(db.get_listing_any(&listing.id).await.expect("query").is_none());
    }

    #[tokio::test]
    async fn upsert_keeps_external_id_when_reporting_error() {
        let db = database().await;
        let owner = user(&db, "owner@example.com").await;
        let listing = db.create_listing(&owner.id, sample("Oak desk")).await.expect("create");
        let active = MarketplaceListingUpdate {
            status: MarketplaceListingStatus::Active,
            external_id: Some("dp-9".into()),
            external_url: Some("https://www.depop.com/products/dp-9".into()),
            error_message: None,
            platform_data: None,
            listed_at: Some(Utc::now()),
        };
        db.upsert_marketplace_listing(&listing.id, Marketplace::Depop, active)
            .await
            .expect("first");
        let failed = db
            .upsert_marketplace_listing(
                &listing.id,
                Marketplace::Depop,
                MarketplaceListingUpdate {
                    status: MarketplaceListingStatus::Error,
                    external_id: None,
                    external_url: None,
                    error_message: Some("Title field missing".into()),
                    platform_data: None,
                    listed_at: None,
                },
            )
            .await
            .expect("second");
        assert_eq!(failed.status, MarketplaceListingStatus::Error);
        assert_eq!(failed.external_id.as_deref(), Some("dp-9"));
        assert_eq!(failed.error_message.as_deref(), Some("Title field missing"));
        assert!(failed.listed_at.is_some());
    }

    #[tokio::test]
    async fn active_page_walks_by_cursor() {
        let db = database().await;
        let owner = user(&db, "owner@example.com").await;
        for n in 0..3 {
            let listing = db
                .create_listing(&owner.id, sample(&format!("Listing {n}")))
                .await
                .expect("create");
            db.upsert_marketplace_listing(
                &listing.id,
                Marketplace::Etsy,
                MarketplaceListingUpdate {
                    status: MarketplaceListingStatus::Active,
                    external_id: Some(format!("etsy-{n}")),
                    external_url: None,
                    error_message: None,
                    platform_data: None,
                    listed_at: None,
                },
            )
            .await
            .expect("upsert");
        }

        let first = db
            .active_marketplace_listings(Some(&owner.id), None, 2)
            .await
            .expect("page");
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].owner_id.as_deref(), Some(owner.id.as_str()));
        assert_eq!(first[0].listing_status, Some(ListingStatus::Draft));
        let cursor = first.last().map(|c| c.record.id.clone());
        let second = db
            .active_marketplace_listings(None, cursor.as_deref(), 2)
            .await
            .expect("page");
        assert_eq!(second.len(), 1);
        assert!(second[0].record.id > first[1].record.id);
    }
}
