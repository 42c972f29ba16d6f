//! HTTP surface: shared state, router assembly and the middleware stack.

mod auth;
mod config;
mod connections;
mod jobs;
mod listings;
mod system;
mod users;

use crate::{
    auth::{PasswordHasher, RevocationList, TokenIssuer, require_user},
    cache::Cache,
    circuit_breaker::{CircuitBreaker, CircuitOptions},
    config::AppConfig,
    db::Database,
    ebay::{EbayAdapter, EbayContext},
    etsy::{EtsyAdapter, EtsyContext},
    idempotency::IdempotencyStore,
    jobs::{JobOptions, JobQueue},
    marketplace::MarketplaceRegistry,
    models::Marketplace,
    security::{self, AllowedOrigins, BodyLimits, RateLimiter},
    selectors::{ConfigStore, HealthProber, SNAPSHOT_BODY_LIMIT, SelectorRegistry},
    uploads::UploadStore,
    workers::{Housekeeping, JobDispatcher},
};
use axum::{Router, extract::DefaultBodyLimit, middleware};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{Value, json};
use std::{sync::Arc, time::Instant};
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::info;

/// The three rate-limit policies, shared with the cleanup job.
#[derive(Clone)]
pub struct Limiters {
    pub auth: Arc<RateLimiter>,
    pub api: Arc<RateLimiter>,
    pub password: Arc<RateLimiter>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Database,
    pub tokens: TokenIssuer,
    pub hasher: Arc<PasswordHasher>,
    pub revocations: Arc<RevocationList>,
    pub uploads: UploadStore,
    pub idempotency: IdempotencyStore,
    pub selectors: Arc<SelectorRegistry>,
    pub prober: Arc<HealthProber>,
    pub marketplaces: Arc<MarketplaceRegistry>,
    pub queue: JobQueue,
    pub limiters: Limiters,
    pub openapi: Arc<Value>,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
}

impl AppState {
    /// Wires every service from `config`. Spawns the job workers but no timers.
    pub async fn build(
        config: AppConfig,
        db: Database,
        selector_store: Arc<dyn ConfigStore>,
        prometheus: PrometheusHandle,
    ) -> Self {
        let config = Arc::new(config);
        let client = crate::http::build_client(config.http_timeout, config.http_connect_timeout);
        let cache = Cache::new(config.redis_url.as_deref());
        let revocations = Arc::new(RevocationList::default());
        let limiters = Limiters {
            auth: Arc::new(RateLimiter::auth(config.rate_limits.auth)),
            api: Arc::new(RateLimiter::api(config.rate_limits.api)),
            password: Arc::new(RateLimiter::password(config.rate_limits.password)),
        };

        let selectors = Arc::new(SelectorRegistry::init(selector_store).await);
        let prober = Arc::new(HealthProber::new(
            selectors.clone(),
            cache.clone(),
            client.clone(),
            config.probe_targets.clone(),
            config.selector_remote_url.clone(),
        ));

        let marketplaces = Arc::new(marketplace_registry(&config, &db, &client));
        let dispatcher = JobDispatcher::new(
            db.clone(),
            marketplaces.clone(),
            Housekeeping {
                revocations: revocations.clone(),
                cache: cache.clone(),
                limiters: vec![
                    limiters.auth.clone(),
                    limiters.api.clone(),
                    limiters.password.clone(),
                ],
            },
        );
        let queue = JobQueue::spawn(
            Arc::new(dispatcher),
            JobOptions {
                capacity: config.queue_capacity,
                concurrency: config.job_concurrency,
                ..JobOptions::default()
            },
        );

        let openapi: Value = serde_yaml::from_str(include_str!("../../docs/openapi.yaml"))
            .unwrap_or_else(|_| json!({ "openapi": "3.0.3" }));

        Self {
            tokens: TokenIssuer::new(&config.jwt_secret, &config.jwt_refresh_secret),
            hasher: Arc::new(PasswordHasher::new(config.bcrypt_cost)),
            uploads: UploadStore::new(config.upload_dir.clone()),
            idempotency: IdempotencyStore::new(cache.clone(), config.idempotency_ttl),
            config,
            db,
            revocations,
            selectors,
            prober,
            marketplaces,
            queue,
            limiters,
            openapi: Arc::new(openapi),
            prometheus,
            started_at: Instant::now(),
        }
    }
}

/// eBay and Etsy adapters are per user and only exist when their credentials are set.
fn marketplace_registry(config: &AppConfig, db: &Database, client: &reqwest::Client) -> MarketplaceRegistry {
    let mut registry = MarketplaceRegistry::new();
    if config.ebay.is_configured() {
        let ctx = EbayContext {
            db: db.clone(),
            client: client.clone(),
            credentials: config.ebay.clone(),
            policies: config.ebay_policies.clone(),
            public_base_url: config.public_base_url.clone(),
        };
        registry.register_factory(Marketplace::Ebay, move |user_id| {
            Arc::new(EbayAdapter::new(ctx.clone(), user_id))
        });
    }
    if config.etsy.is_configured() {
        let ctx = EtsyContext {
            db: db.clone(),
            client: client.clone(),
            credentials: config.etsy.clone(),
            breaker: Arc::new(CircuitBreaker::new("etsy", CircuitOptions::default())),
            public_base_url: config.public_base_url.clone(),
        };
        registry.register_factory(Marketplace::Etsy, move |user_id| {
            Arc::new(EtsyAdapter::new(ctx.clone(), user_id))
        });
    }
    info!(
        target = "syncsellr.api",
        platforms = ?registry.platforms(),
        "marketplace adapters registered"
    );
    registry
}

pub fn router(state: AppState) -> Router {
    let origins = AllowedOrigins::new(&state.config.cors_origins);
    let body_limit = state.config.request_max_bytes;
    let sanitize_limits = BodyLimits {
        json: body_limit,
        snapshot: SNAPSHOT_BODY_LIMIT,
    };

    let protected = Router::new()
        .nest("/listings", listings::routes())
        .nest("/connections", connections::routes())
        .nest("/users", users::routes())
        .nest("/jobs", jobs::routes())
        .route_layer(middleware::from_fn_with_state(state.tokens.clone(), require_user));

    let api = Router::new()
        .nest(
            "/auth",
            auth::routes(&state).layer(middleware::from_fn_with_state(
                state.limiters.auth.clone(),
                security::rate_limit,
            )),
        )
        .nest("/config", config::routes(&state))
        .merge(protected)
        .layer(middleware::from_fn_with_state(sanitize_limits, security::sanitize_json_body))
        .layer(middleware::from_fn_with_state(origins.clone(), security::csrf_guard))
        .layer(middleware::from_fn_with_state(
            state.limiters.api.clone(),
            security::rate_limit,
        ));

    Router::new()
        .merge(system::routes())
        .nest("/api", api)
        .nest_service("/uploads", ServeDir::new(state.uploads.dir()))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(security::cors_layer(origins))
        .layer(middleware::from_fn(security::security_headers))
}
