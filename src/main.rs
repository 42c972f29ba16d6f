mod auth;
mod autofill;
mod cache;
mod circuit_breaker;
mod config;
mod connections;
mod db;
mod ebay;
mod error;
mod etsy;
mod http;
mod idempotency;
mod jobs;
mod listings;
mod marketplace;
mod metrics;
mod models;
mod routes;
mod security;
mod selectors;
mod sync;
mod uploads;
mod users;
mod workers;

use config::AppConfig;
use db::Database;
use jobs::{JobKind, Priority};
use metrics_exporter_prometheus::PrometheusBuilder;
use routes::AppState;
use selectors::{ConfigStore, FileStore, SelectorRegistry};
use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "syncsellr.api", "server crashed: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    let db = Database::connect(&config.database_url).await?;
    let prometheus = PrometheusBuilder::new().install_recorder()?;
    let selector_store: Arc<dyn ConfigStore> = Arc::new(FileStore::new(config.selector_cache_path.clone()));
    let state = AppState::build(config, db.clone(), selector_store, prometheus).await;
    state.uploads.ensure_dir().await?;

    if let Some(path) = &state.config.selector_config_path {
        apply_published_selectors(&state.selectors, path).await;
    }

    let mut timers = vec![
        jobs::schedule(
            state.queue.clone(),
            JobKind::CleanupExpired,
            Priority::Low,
            state.config.cleanup_interval,
        ),
        state.prober.clone().spawn(state.config.probe_interval),
    ];
    if let Some(every) = state.config.sync_interval {
        timers.push(jobs::schedule(
            state.queue.clone(),
            JobKind::SyncMarketplace { user_id: None },
            Priority::Low,
            every,
        ));
        info!(target = "syncsellr.sync", every_secs = every.as_secs(), "marketplace sync scheduled");
    }

    let addr: SocketAddr = ([0, 0, 0, 0], state.config.port).into();
    let app = routes::router(state.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        target = "syncsellr.api",
        environment = ?state.config.environment,
        "listening on {addr}"
    );
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!(target = "syncsellr.api", "shutting down");
    for timer in timers {
        timer.abort();
    }
    if tokio::time::timeout(DRAIN_TIMEOUT, state.queue.close()).await.is_err() {
        warn!(target = "syncsellr.jobs", "job queue did not drain in time");
    }
    db.close().await;
    Ok(())
}

/// Operators can publish a selector file next to the binary; it is applied
/// like a remote update so older versions are ignored.
async fn apply_published_selectors(registry: &SelectorRegistry, path: &Path) {
    match FileStore::new(path).load().await {
        Ok(Some(config)) => {
            let version = config.version.clone();
            if registry.update_from_remote(config).await {
                info!(target = "syncsellr.selectors", %version, path = %path.display(), "published selector config applied");
            }
        }
        Ok(None) => warn!(target = "syncsellr.selectors", path = %path.display(), "published selector config not found"),
        Err(err) => warn!(target = "syncsellr.selectors", path = %path.display(), error = %err, "published selector config unreadable"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(target = "syncsellr.api", error = %err, "ctrl-c handler failed");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(target = "syncsellr.api", error = %err, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let _ = if json {
        fmt().json().with_env_filter(filter).try_init()
    } else {
        fmt().with_env_filter(filter).try_init()
    };
}
