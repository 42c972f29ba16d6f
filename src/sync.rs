use crate::{
    db::{Database, SyncCandidate},
    error::AppError,
    marketplace::MarketplaceRegistry,
    metrics,
    models::{ConnectionStatus, ListingStatus, MarketplaceListingStatus},
};
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const BATCH_SIZE: u32 = 50;
pub const CHUNK_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub processed: usize,
    pub updated: usize,
    pub ended: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Unchanged,
    Updated,
    Ended,
    Skipped,
}

/// Pulls listing status from each marketplace and folds it back into the
/// local records.
pub struct SyncWorker {
    db: Database,
    registry: Arc<MarketplaceRegistry>,
    batch_size: u32,
    chunk_size: usize,
}

impl SyncWorker {
    pub fn new(db: Database, registry: Arc<MarketplaceRegistry>) -> Self {
        Self {
            db,
            registry,
            batch_size: BATCH_SIZE,
            chunk_size: CHUNK_SIZE,
        }
    }

    /// Walks every active record, or only `user_id`'s. A failing record is
    /// counted and the run carries on.
    pub async fn run(&self, user_id: Option<&str>) -> Result<SyncReport, sqlx::Error> {
        let mut report = SyncReport::default();
        let mut cursor: Option<String> = None;
        loop {
            let batch = self
                .db
                .active_marketplace_listings(user_id, cursor.as_deref(), self.batch_size)
                .await?;
            let Some(last) = batch.last() else { break };
            cursor = Some(last.record.id.clone());

            for chunk in batch.chunks(self.chunk_size.max(1)) {
                let outcomes = join_all(chunk.iter().map(|candidate| self.sync_one(candidate))).await;
                for (candidate, outcome) in chunk.iter().zip(outcomes) {
                    report.processed += 1;
                    match outcome {
                        Ok(Outcome::Updated) => report.updated += 1,
                        Ok(Outcome::Ended) => report.ended += 1,
                        Ok(Outcome::Skipped) => report.skipped += 1,
                        Ok(Outcome::Unchanged) => {}
                        Err(err) => {
                            report.errors += 1;
                            warn!(
                                target = "syncsellr.sync",
                                record_id = %candidate.record.id,
                                marketplace = %candidate.record.marketplace,
                                error = %err,
                                "listing sync failed"
                            );
                        }
                    }
                }
            }
            if batch.len() < self.batch_size as usize {
                break;
            }
        }

        metrics::sync_batch(report.processed, report.updated + report.ended, report.errors);
        info!(
            target = "syncsellr.sync",
            user_id = user_id.unwrap_or("*"),
            processed = report.processed,
            updated = report.updated,
            ended = report.ended,
            skipped = report.skipped,
            errors = report.errors,
            "marketplace sync finished"
        );
        Ok(report)
    }

    async fn sync_one(&self, candidate: &SyncCandidate) -> Result<Outcome, AppError> {
        let record = &candidate.record;
        let owner = match (candidate.owner_id.as_deref(), candidate.listing_status) {
            (Some(owner), Some(status)) if status != ListingStatus::Archived => owner,
            _ => {
                self.db
                    .set_marketplace_listing_status(&record.id, MarketplaceListingStatus::Ended)
                    .await?;
                debug!(target = "syncsellr.sync", record_id = %record.id, "parent listing gone; record ended");
                return Ok(Outcome::Ended);
            }
        };

        let Some(adapter) = self.registry.get_for_user(record.marketplace, owner).await else {
            return Ok(Outcome::Skipped);
        };
        let Some(connection) = self
            .db
            .find_connection(owner, record.marketplace)
            .await?
            .filter(|c| c.status == ConnectionStatus::Connected)
        else {
            return Ok(Outcome::Skipped);
        };
        if connection.token_expires_at.is_some_and(|at| at <= Utc::now()) {
            self.db
                .set_connection_status(&connection.id, ConnectionStatus::Error)
                .await?;
            warn!(
                target = "syncsellr.sync",
                user_id = owner,
                marketplace = %record.marketplace,
                "connection token expired"
            );
            return Ok(Outcome::Skipped);
        }

        let status = MarketplaceListingStatus::from(adapter.sync_status(record).await?);
        let outcome = if status != record.status {
            self.db.set_marketplace_listing_status(&record.id, status).await?;
            info!(
                target = "syncsellr.sync",
                record_id = %record.id,
                from = %record.status,
                to = %status,
                "marketplace listing status changed"
            );
            Outcome::Updated
        } else {
            Outcome::Unchanged
        };
        self.db.touch_connection_sync(&connection.id).await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{ListingChanges, MarketplaceListingUpdate, NewListing, StoredTokens, test_support},
        marketplace::{ExternalStatus, registry::tests::StubAdapter},
        models::Marketplace,
    };
    use chrono::Duration;

    async fn fixture(status: ExternalStatus) -> (Database, SyncWorker, String, String) {
        let db = test_support::database().await;
        let owner = test_support::user(&db, "seller@example.com").await;
        let listing = db
            .create_listing(
                &owner.id,
                NewListing {
                    title: "Teak sideboard".into(),
                    price: 300.0,
                    sku: "TF-1".into(),
                    ..NewListing::default()
                },
            )
            .await
            .expect("listing");
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
        db.store_tokens(
            &owner.id,
            Marketplace::Etsy,
            &StoredTokens {
                access_token: "a".into(),
                refresh_token: Some("r".into()),
                expires_at: Utc::now() + Duration::hours(1),
            },
        )
        .await
        .expect("connection");

        let mut registry = MarketplaceRegistry::new();
        registry.register_factory(Marketplace::Etsy, move |user_id| {
            Arc::new(StubAdapter {
                platform: Marketplace::Etsy,
                user_id: user_id.to_string(),
                status,
            })
        });
        let worker = SyncWorker::new(db.clone(), Arc::new(registry));
        (db, worker, owner.id, listing.id)
    }

    async fn record_status(db: &Database, listing_id: &str) -> (MarketplaceListingStatus, bool) {
        let listing = db.get_listing_any(listing_id).await.expect("query").expect("listing");
        let record = &listing.marketplace_listings[0];
        (record.status, record.ended_at.is_some())
    }

    #[tokio::test]
    async fn sold_listing_is_updated_and_connection_stamped() {
        let (db, worker, owner, listing_id) = fixture(ExternalStatus::Sold).await;
        let report = worker.run(None).await.expect("run");
        assert_eq!(report.processed, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(record_status(&db, &listing_id).await, (MarketplaceListingStatus::Sold, true));
        let connection = db
            .find_connection(&owner, Marketplace::Etsy)
            .await
            .expect("query")
            .expect("connection");
        assert!(connection.last_sync_at.is_some());
    }

    #[tokio::test]
    async fn unchanged_status_is_left_alone() {
        let (db, worker, _, listing_id) = fixture(ExternalStatus::Active).await;
        let report = worker.run(None).await.expect("run");
        assert_eq!(report.updated, 0);
        assert_eq!(report.errors, 0);
        assert_eq!(record_status(&db, &listing_id).await, (MarketplaceListingStatus::Active, false));
    }

    #[tokio::test]
    async fn archived_parent_ends_the_record() {
        let (db, worker, owner, listing_id) = fixture(ExternalStatus::Active).await;
        db.update_listing(
            &listing_id,
            &owner,
            ListingChanges {
                status: Some(ListingStatus::Archived),
                ..ListingChanges::default()
            },
        )
        .await
        .expect("archive");
        let report = worker.run(Some(&owner)).await.expect("run");
        assert_eq!(report.ended, 1);
        assert_eq!(record_status(&db, &listing_id).await, (MarketplaceListingStatus::Ended, true));
    }

    #[tokio::test]
    async fn expired_token_marks_connection_error() {
        let (db, worker, owner, listing_id) = fixture(ExternalStatus::Sold).await;
        db.store_tokens(
            &owner,
            Marketplace::Etsy,
            &StoredTokens {
                access_token: "a".into(),
                refresh_token: None,
                expires_at: Utc::now() - Duration::minutes(1),
            },
        )
        .await
        .expect("expire");
        let report = worker.run(None).await.expect("run");
        assert_eq!(report.skipped, 1);
        assert_eq!(record_status(&db, &listing_id).await.0, MarketplaceListingStatus::Active);
        let connection = db
            .find_connection(&owner, Marketplace::Etsy)
            .await
            .expect("query")
            .expect("connection");
        assert_eq!(connection.status, ConnectionStatus::Error);
    }

    #[tokio::test]
    async fn missing_adapter_skips() {
        let (db, _, _, listing_id) = fixture(ExternalStatus::Sold).await;
        let worker = SyncWorker::new(db.clone(), Arc::new(MarketplaceRegistry::new()));
        assert_eq!(worker.run(None).await.expect("run").skipped, 1);
        assert_eq!(record_status(&db, &listing_id).await.0, MarketplaceListingStatus::Active);
    }

    #[tokio::test]
    async fn missing_connection_skips() {
        let (db, worker, owner, listing_id) = fixture(ExternalStatus::Sold).await;
        db.delete_connection(&owner, Marketplace::Etsy).await.expect("delete");
        assert_eq!(worker.run(None).await.expect("run").skipped, 1);
        assert_eq!(record_status(&db, &listing_id).await.0, MarketplaceListingStatus::Active);
    }

    #[tokio::test]
    async fn other_users_are_not_touched() {
        let (db, worker, _, listing_id) = fixture(ExternalStatus::Sold).await;
        let report = worker.run(Some("someone-else")).await.expect("run");
        assert_eq!(report.processed, 0);
        assert_eq!(record_status(&db, &listing_id).await.0, MarketplaceListingStatus::Active);
    }

    #[tokio::test]
    async fn batches_are_walked_by_cursor() {
        let (db, mut worker, owner, _) = fixture(ExternalStatus::Ended).await;
        for n in 0..6 {
            let listing = db
                .create_listing(
                    &owner,
                    NewListing {
                        title: format!("Chair number {n}"),
                        price: 20.0,
                        sku: format!("TF-c{n}"),
                        ..NewListing::default()
                    },
                )
                .await
                .expect("listing");
            db.upsert_marketplace_listing(
                &listing.id,
                Marketplace::Etsy,
                MarketplaceListingUpdate {
                    status: MarketplaceListingStatus::Active,
                    external_id: Some(format!("e{n}")),
                    external_url: None,
                    error_message: None,
                    platform_data: None,
                    listed_at: None,
                },
            )
            .await
            .expect("record");
        }
        worker.batch_size = 2;
        worker.chunk_size = 1;
        let report = worker.run(None).await.expect("run");
        assert_eq!(report.processed, 7);
        assert_eq!(report.updated, 7);
        assert_eq!(worker.run(None).await.expect("rerun").processed, 0);
    }
}
