use super::{
    health::run_health_check,
    page::{HttpPage, PageSource},
    registry::{RefreshOutcome, SelectorRegistry},
    types::{HealthCheckResult, HealthStatus},
};
use crate::{cache::Cache, config::ProbeTarget, metrics};
use reqwest::Client;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::{sync::RwLock, task::JoinHandle};
use tracing::{info, warn};

const CACHE_PREFIX: &str = "selector-health:";
const CACHE_TTL: Duration = Duration::from_secs(24 * 3600);

/// Periodically checks live marketplace pages against the current selectors.
pub struct HealthProber {
    registry: Arc<SelectorRegistry>,
    cache: Cache,
    client: Client,
    targets: Vec<ProbeTarget>,
    remote_url: Option<String>,
    latest: RwLock<BTreeMap<String, HealthCheckResult>>,
}

impl HealthProber {
    pub fn new(
        registry: Arc<SelectorRegistry>,
        cache: Cache,
        client: Client,
        targets: Vec<ProbeTarget>,
        remote_url: Option<String>,
    ) -> Self {
        Self {
            registry,
            cache,
            client,
            targets,
            remote_url,
            latest: RwLock::new(BTreeMap::new()),
        }
    }

    /// One round: refresh the config if a remote is set, then probe every target.
    pub async fn probe_once(&self) -> Vec<HealthCheckResult> {
        if let Some(url) = &self.remote_url {
            match self.registry.refresh_from_remote(&self.client, url).await {
                Ok(RefreshOutcome::Updated { version }) => {
                    info!(target = "syncsellr.selectors", %version, "remote selector config applied");
                    self.forget_results().await;
                }
                Ok(outcome) => {
                    info!(target = "syncsellr.selectors", outcome = ?outcome, "remote selector config checked")
                }
                Err(err) => {
                    warn!(target = "syncsellr.selectors", error = %err, "remote selector refresh failed")
                }
            }
        }

        let mut results = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            let page = HttpPage::new(self.client.clone(), target.url.clone());
            match self.probe_page(&target.platform, &page).await {
                Some(result) => results.push(result),
                None => continue,
            }
        }
        results
    }

    /// Probes one page and records the outcome. `None` when the snapshot failed.
    pub async fn probe_page(&self, platform: &str, page: &dyn PageSource) -> Option<HealthCheckResult> {
        let html = match page.snapshot().await {
            Ok(html) => html,
            Err(err) => {
                warn!(target = "syncsellr.selectors", platform, error = %err, "probe fetch failed");
                return None;
            }
        };
        let config = self.registry.config().await;
        let result = run_health_check(&config, platform, &html);
        self.record(result.clone()).await;
        Some(result)
    }

    pub async fn record(&self, result: HealthCheckResult) {
        let found = result.results.values().filter(|probe| probe.found).count();
        match result.overall_status {
            HealthStatus::Healthy => info!(
                target = "syncsellr.selectors",
                platform = %result.platform,
                found,
                total = result.results.len(),
                "selectors healthy"
            ),
            status => {
                let missing: Vec<&str> = result
                    .results
                    .iter()
                    .filter(|(_, probe)| !probe.found)
                    .map(|(key, _)| key.as_str())
                    .collect();
                warn!(
                    target = "syncsellr.selectors",
                    platform = %result.platform,
                    status = status.as_str(),
                    missing = ?missing,
                    "selectors need attention"
                );
            }
        }
        metrics::probe_recorded(&result.platform, result.overall_status.as_str());
        self.cache
            .set_json(
                &format!("{CACHE_PREFIX}{}", result.platform),
                &result,
                Some(CACHE_TTL),
            )
            .await;
        self.latest
            .write()
            .await
            .insert(result.platform.clone(), result);
    }

    /// Latest result per platform. Platforms not probed since startup fall back
    /// to the cached copy, so results survive a restart.
    pub async fn latest(&self) -> Vec<HealthCheckResult> {
        let mut results = self.latest.read().await.clone();
        let platforms: Vec<String> = self.registry.config().await.platforms.into_keys().collect();
        for platform in platforms {
            if results.contains_key(&platform) {
                continue;
            }
            if let Some(cached) = self.latest_for(&platform).await {
                results.insert(platform, cached);
            }
        }
        results.into_values().collect()
    }

    /// Results measured against an older config no longer describe the live selectors.
    async fn forget_results(&self) {
        let platforms: Vec<String> = std::mem::take(&mut *self.latest.write().await)
            .into_keys()
            .chain(self.registry.config().await.platforms.into_keys())
            .collect();
        for platform in platforms {
            self.cache.del(&format!("{CACHE_PREFIX}{platform}")).await;
        }
    }

    pub async fn latest_for(&self, platform: &str) -> Option<HealthCheckResult> {
        if let Some(result) = self.latest.read().await.get(platform) {
            return Some(result.clone());
        }
        self.cache
            .get_json(&format!("{CACHE_PREFIX}{platform}"))
            .await
    }

    pub fn spawn(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            if self.targets.is_empty() && self.remote_url.is_none() {
                info!(target = "syncsellr.selectors", "no probe targets configured; prober idle");
                return;
            }
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let results = self.probe_once().await;
                info!(
                    target = "syncsellr.selectors",
                    probed = results.len(),
                    "selector probe round finished"
                );
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selectors::{page::StaticPage, store::MemoryStore};

    async fn health_monitor() -> HealthProber {
        let registry = Arc::new(SelectorRegistry::init(Arc::new(MemoryStore::default())).await);
        HealthProber::new(registry, Cache::in_memory(), Client::new(), Vec::new(), None)
    }

    #[tokio::test]
    async fn checked_pages_record_latest_per_platform() {
        let prober = health_monitor().await;
        let page = StaticPage(
            r#"<input name="title"><textarea name="description"></textarea>"#.into(),
        );
        let result = prober.probe_page("gumtree", &page).await.expect("result");
        assert_eq!(result.overall_status, HealthStatus::Broken);
        assert!(result.results["titleInput"].found);

        let latest = prober.latest().await;
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].platform, "gumtree");
    }

    #[tokio::test]
    async fn latest_for_reads_through_cache() {
        let prober = health_monitor().await;
        let page = StaticPage(r#"<input name="title">"#.into());
        prober.probe_page("vinted", &page).await.expect("result");
        prober.latest.write().await.clear();
        let cached = prober.latest_for("vinted").await.expect("cached");
        assert_eq!(cached.platform, "vinted");
        assert!(prober.latest_for("depop").await.is_none());
    }

    #[tokio::test]
    async fn latest_falls_back_to_cached_results_after_restart() {
        let registry = Arc::new(SelectorRegistry::init(Arc::new(MemoryStore::default())).await);
        let cache = Cache::in_memory();
        let before = HealthProber::new(registry.clone(), cache.clone(), Client::new(), Vec::new(), None);
        before
            .probe_page("depop", &StaticPage(r#"<input name="title">"#.into()))
            .await
            .expect("result");

        let after = HealthProber::new(registry, cache, Client::new(), Vec::new(), None);
        let latest = after.latest().await;
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].platform, "depop");

        after.forget_results().await;
        assert!(after.latest().await.is_empty());
    }

    #[tokio::test]
    async fn no_targets_means_empty_round() {
        let prober = health_monitor().await;
        assert!(prober.probe_once().await.is_empty());
    }
}
