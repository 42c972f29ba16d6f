//! Executes queued jobs against the database and marketplace adapters.

use crate::{
    auth::RevocationList,
    cache::Cache,
    db::{Database, MarketplaceListingUpdate},
    jobs::{JobFailed, JobHandler, JobKind},
    marketplace::MarketplaceRegistry,
    models::{Marketplace, MarketplaceListingStatus},
    security::RateLimiter,
    sync::SyncWorker,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};

/// In-process state the cleanup job sweeps.
#[derive(Clone)]
pub struct Housekeeping {
    pub revocations: Arc<RevocationList>,
    pub cache: Cache,
    pub limiters: Vec<Arc<RateLimiter>>,
}

pub struct JobDispatcher {
    db: Database,
    registry: Arc<MarketplaceRegistry>,
    sync: SyncWorker,
    housekeeping: Housekeeping,
}

impl JobDispatcher {
    pub fn new(db: Database, registry: Arc<MarketplaceRegistry>, housekeeping: Housekeeping) -> Self {
        Self {
            sync: SyncWorker::new(db.clone(), registry.clone()),
            db,
            registry,
            housekeeping,
        }
    }

    async fn publish(&self, listing_id: &str, marketplace: Marketplace, user_id: &str) -> Result<Value, JobFailed> {
        let listing = self
            .db
            .get_listing_any(listing_id)
            .await?
            .filter(|l| l.user_id == user_id)
            .ok_or_else(|| JobFailed(format!("listing {listing_id} not found")))?;
        if let Some(existing) = listing.marketplace_listing(marketplace)
            && existing.status == MarketplaceListingStatus::Active
        {
            return Ok(json!({ "success": true, "alreadyPublished": true }));
        }
        let adapter = self
            .registry
            .get_for_user(marketplace, user_id)
            .await
            .ok_or_else(|| JobFailed(format!("no adapter registered for {marketplace}")))?;

        self.db
            .upsert_marketplace_listing(&listing.id, marketplace, record_update(MarketplaceListingStatus::Pending))
            .await?;

        let result = match adapter.publish_listing(&listing).await {
            Ok(result) => result,
            Err(err) => {
                self.db
                    .upsert_marketplace_listing(
                        &listing.id,
                        marketplace,
                        MarketplaceListingUpdate {
                            error_message: Some(err.to_string()),
                            ..record_update(MarketplaceListingStatus::Error)
                        },
                    )
                    .await?;
                return Err(err.into());
            }
        };

        let update = if result.success {
            MarketplaceListingUpdate {
                external_id: result.external_id.clone(),
                external_url: result.external_url.clone(),
                platform_data: result.platform_data.clone(),
                listed_at: Some(Utc::now()),
                ..record_update(MarketplaceListingStatus::Active)
            }
        } else {
            MarketplaceListingUpdate {
                error_message: result.error.clone(),
                ..record_update(MarketplaceListingStatus::Error)
            }
        };
        self.db
            .upsert_marketplace_listing(&listing.id, marketplace, update)
            .await?;
        info!(
            target = "syncsellr.jobs",
            listing_id,
            marketplace = marketplace.as_str(),
            success = result.success,
            "publish finished"
        );
        Ok(serde_json::to_value(&result).unwrap_or(Value::Null))
    }

    async fn update(&self, listing_id: &str, marketplace: Marketplace, user_id: &str) -> Result<Value, JobFailed> {
        let listing = self
            .db
            .get_listing_any(listing_id)
            .await?
            .filter(|l| l.user_id == user_id)
            .ok_or_else(|| JobFailed(format!("listing {listing_id} not found")))?;
        let Some(record) = listing
            .marketplace_listing(marketplace)
            .filter(|r| r.status == MarketplaceListingStatus::Active && r.external_id.is_some())
            .cloned()
        else {
            return Ok(json!({ "skipped": true }));
        };
        let adapter = self
            .registry
            .get_for_user(marketplace, user_id)
            .await
            .ok_or_else(|| JobFailed(format!("no adapter registered for {marketplace}")))?;

        let result = adapter.update_listing(&record, &listing).await?;
        if !result.success {
            warn!(
                target = "syncsellr.jobs",
                listing_id,
                marketplace = marketplace.as_str(),
                error = result.error.as_deref().unwrap_or_default(),
                "marketplace update rejected"
            );
        }
        // The listing stays live either way; only the last error is recorded.
        self.db
            .upsert_marketplace_listing(
                &listing.id,
                marketplace,
                MarketplaceListingUpdate {
                    error_message: result.error.clone(),
                    ..record_update(MarketplaceListingStatus::Active)
                },
            )
            .await?;
        Ok(serde_json::to_value(&result).unwrap_or(Value::Null))
    }

    async fn cleanup(&self) -> Result<Value, JobFailed> {
        let revocations = self.housekeeping.revocations.purge_expired().await;
        let oauth_states = self.db.purge_expired_oauth_states().await?;
        let cache_entries = self.housekeeping.cache.purge_expired().await;
        let mut rate_buckets = 0;
        for limiter in &self.housekeeping.limiters {
            rate_buckets += limiter.prune().await;
        }
        let adapters = self.registry.prune().await;
        info!(
            target = "syncsellr.jobs",
            revocations,
            oauth_states,
            cache_entries,
            rate_buckets,
            adapters,
            "expired state purged"
        );
        Ok(json!({
            "revokedTokens": revocations,
            "oauthStates": oauth_states,
            "cacheEntries": cache_entries,
            "rateLimitBuckets": rate_buckets,
            "cachedAdapters": adapters,
        }))
    }
}

fn record_update(status: MarketplaceListingStatus) -> MarketplaceListingUpdate {
    MarketplaceListingUpdate {
        status,
        external_id: None,
        external_url: None,
        error_message: None,
        platform_data: None,
        listed_at: None,
    }
}

#[async_trait]
impl JobHandler for JobDispatcher {
    async fn handle(&self, job: &JobKind) -> Result<Value, JobFailed> {
        match job {
            JobKind::SyncMarketplace { user_id } => {
                let report = self.sync.run(user_id.as_deref()).await?;
                Ok(serde_json::to_value(report).unwrap_or(Value::Null))
            }
            JobKind::PublishListing {
                listing_id,
                marketplace,
                user_id,
            } => self.publish(listing_id, *marketplace, user_id).await,
            JobKind::UpdateListing {
                listing_id,
                marketplace,
                user_id,
            } => self.update(listing_id, *marketplace, user_id).await,
            JobKind::CleanupExpired => self.cleanup().await,
        }
    }
}
