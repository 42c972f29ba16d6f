use super::{
    SelectorError,
    defaults::DEFAULT_SELECTOR_CONFIG,
    page::{PageSource, first_match},
    store::ConfigStore,
    types::{Resolution, SelectorConfig, VersionedSelector},
};
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::RwLock,
    time::{Instant, sleep},
};
use tracing::{debug, info, warn};

pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_millis(5000);
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefreshOutcome {
    NotModified,
    Updated { version: String },
    Rejected,
}

/// Current selector config shared across the service.
pub struct SelectorRegistry {
    config: RwLock<SelectorConfig>,
    store: Arc<dyn ConfigStore>,
    last_refreshed: RwLock<Option<DateTime<Utc>>>,
}

impl SelectorRegistry {
    /// Loads the persisted config, falling back to the bundled defaults. Never fails.
    pub async fn init(store: Arc<dyn ConfigStore>) -> Self {
        let config = match store.load().await {
            Ok(Some(stored)) if stored.is_valid() => {
                info!(
                    target = "syncsellr.selectors",
                    version = %stored.version,
                    updated_at = %stored.updated_at,
                    "loaded cached selector config"
                );
                stored
            }
            Ok(Some(_)) => {
                warn!(target = "syncsellr.selectors", "cached selector config is invalid; using bundled defaults");
                DEFAULT_SELECTOR_CONFIG.clone()
            }
            Ok(None) => {
                info!(
                    target = "syncsellr.selectors",
                    version = %DEFAULT_SELECTOR_CONFIG.version,
                    "no cached selector config; using bundled defaults"
                );
                DEFAULT_SELECTOR_CONFIG.clone()
            }
            Err(err) => {
                warn!(target = "syncsellr.selectors", error = %err, "failed to load cached selector config; using bundled defaults");
                DEFAULT_SELECTOR_CONFIG.clone()
            }
        };
        Self {
            config: RwLock::new(config),
            store,
            last_refreshed: RwLock::new(None),
        }
    }

    /// Candidates for a field from the current config, else the bundled defaults.
    pub async fn candidates(&self, platform: &str, key: &str) -> Vec<VersionedSelector> {
        let config = self.config.read().await;
        config
            .candidates(platform, key)
            .or_else(|| DEFAULT_SELECTOR_CONFIG.candidates(platform, key))
            .map(<[VersionedSelector]>::to_vec)
            .unwrap_or_default()
    }

    pub async fn selectors(&self, platform: &str, key: &str) -> Vec<String> {
        self.candidates(platform, key)
            .await
            .into_iter()
            .map(|candidate| candidate.css)
            .collect()
    }

    /// Tries each candidate in order against `page`, re-snapshotting every
    /// 200 ms until `timeout` elapses.
    pub async fn resolve(
        &self,
        platform: &str,
        key: &str,
        page: &dyn PageSource,
        timeout: Duration,
    ) -> Option<Resolution> {
        let candidates = self.candidates(platform, key).await;
        if candidates.is_empty() {
            warn!(target = "syncsellr.selectors", platform, key, "no selectors configured");
            return None;
        }

        let deadline = Instant::now() + timeout;
        loop {
            match page.snapshot().await {
                Ok(html) => {
                    if let Some(hit) = first_match(&html, &candidates) {
                        let candidate = &candidates[hit.index];
                        debug!(
                            target = "syncsellr.selectors",
                            platform,
                            key,
                            index = hit.index,
                            version = %candidate.version,
                            css = %candidate.css,
                            "selector resolved"
                        );
                        return Some(Resolution {
                            platform: platform.to_string(),
                            key: key.to_string(),
                            index: hit.index,
                            version: candidate.version.clone(),
                            css: candidate.css.clone(),
                            element_html: hit.element_html,
                        });
                    }
                }
                Err(err) => {
                    warn!(target = "syncsellr.selectors", platform, key, error = %err, "page snapshot failed")
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            sleep(POLL_INTERVAL).await;
        }

        warn!(
            target = "syncsellr.selectors",
            platform,
            key,
            timeout_ms = timeout.as_millis() as u64,
            "no selector matched before timeout"
        );
        None
    }

    /// Swaps in `config` and persists it. Returns `false` when it was rejected.
    pub async fn update_from_remote(&self, config: SelectorConfig) -> bool {
        if !config.is_valid() {
            warn!(
                target = "syncsellr.selectors",
                version = %config.version,
                "invalid remote selector config ignored"
            );
            return false;
        }

        *self.config.write().await = config.clone();
        match self.store.save(&config).await {
            Ok(()) => info!(
                target = "syncsellr.selectors",
                version = %config.version,
                "selector config updated and cached"
            ),
            Err(err) => warn!(
                target = "syncsellr.selectors",
                version = %config.version,
                error = %err,
                "selector config updated but not persisted"
            ),
        }
        true
    }

    /// Polls `url?v=<current>`; only a config with a different version is applied.
    pub async fn refresh_from_remote(
        &self,
        client: &Client,
        url: &str,
    ) -> Result<RefreshOutcome, SelectorError> {
        let current = self.version().await;
        let response = client.get(url).query(&[("v", current.as_str())]).send().await?;

        if response.status() == StatusCode::NOT_MODIFIED {
            self.mark_refreshed().await;
            return Ok(RefreshOutcome::NotModified);
        }
        if !response.status().is_success() {
            return Err(SelectorError::Fetch(format!("HTTP {}", response.status())));
        }

        let remote: SelectorConfig = response.json().await?;
        if remote.version == current {
            self.mark_refreshed().await;
            return Ok(RefreshOutcome::NotModified);
        }
        let version = remote.version.clone();
        if self.update_from_remote(remote).await {
            self.mark_refreshed().await;
            Ok(RefreshOutcome::Updated { version })
        } else {
            Ok(RefreshOutcome::Rejected)
        }
    }

    async fn mark_refreshed(&self) {
        *self.last_refreshed.write().await = Some(Utc::now());
    }

    pub async fn version(&self) -> String {
        self.config.read().await.version.clone()
    }

    pub async fn last_updated(&self) -> String {
        self.config.read().await.updated_at.clone()
    }

    pub async fn config(&self) -> SelectorConfig {
        self.config.read().await.clone()
    }

    /// True when no refresh has succeeded within `max_age`.
    pub async fn is_stale(&self, max_age: Duration) -> bool {
        match *self.last_refreshed.read().await {
            None => true,
            Some(at) => chrono::Duration::from_std(max_age)
                .map(|max_age| Utc::now() - at > max_age)
                .unwrap_or(false),
        }
    }
}
