use super::MarketplaceAdapter;
use crate::models::Marketplace;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;

pub const USER_ADAPTER_TTL: Duration = Duration::from_secs(5 * 60);

type AdapterFactory = Box<dyn Fn(&str) -> Arc<dyn MarketplaceAdapter> + Send + Sync>;

struct CachedAdapter {
    adapter: Arc<dyn MarketplaceAdapter>,
    created_at: Instant,
}

/// Looks up the adapter for a marketplace, building per-user instances on demand.
pub struct MarketplaceRegistry {
    adapters: HashMap<Marketplace, Arc<dyn MarketplaceAdapter>>,
    factories: HashMap<Marketplace, AdapterFactory>,
    user_cache: Mutex<HashMap<(Marketplace, String), CachedAdapter>>,
    ttl: Duration,
}

impl Default for MarketplaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketplaceRegistry {
    pub fn new() -> Self {
        Self::with_ttl(USER_ADAPTER_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            adapters: HashMap::new(),
            factories: HashMap::new(),
            user_cache: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    #[cfg(test)]
    pub fn register(&mut self, adapter: Arc<dyn MarketplaceAdapter>) {
        self.adapters.insert(adapter.platform(), adapter);
    }

    pub fn register_factory<F>(&mut self, marketplace: Marketplace, factory: F)
    where
        F: Fn(&str) -> Arc<dyn MarketplaceAdapter> + Send + Sync + 'static,
    {
        self.factories.insert(marketplace, Box::new(factory));
    }

    pub fn get(&self, marketplace: Marketplace) -> Option<Arc<dyn MarketplaceAdapter>> {
        self.adapters.get(&marketplace).cloned()
    }

    /// Per-user adapter when a factory is registered, else the shared one.
    pub async fn get_for_user(
        &self,
        marketplace: Marketplace,
        user_id: &str,
    ) -> Option<Arc<dyn MarketplaceAdapter>> {
        let Some(factory) = self.factories.get(&marketplace) else {
            return self.get(marketplace);
        };
        let key = (marketplace, user_id.to_string());
        let mut cache = self.user_cache.lock().await;
        if let Some(cached) = cache.get(&key)
            && cached.created_at.elapsed() < self.ttl
        {
            return Some(cached.adapter.clone());
        }
        let adapter = factory(user_id);
        cache.insert(
            key,
            CachedAdapter {
                adapter: adapter.clone(),
                created_at: Instant::now(),
            },
        );
        Some(adapter)
    }

    pub fn has(&self, marketplace: Marketplace) -> bool {
        self.adapters.contains_key(&marketplace) || self.factories.contains_key(&marketplace)
    }

    pub fn platforms(&self) -> Vec<Marketplace> {
        let mut all: Vec<Marketplace> = self
            .adapters
            .keys()
            .chain(self.factories.keys())
            .copied()
            .collect();
        all.sort();
        all.dedup();
        all
    }

    /// Drops cached per-user adapters older than the TTL.
    pub async fn prune(&self) -> usize {
        let mut cache = self.user_cache.lock().await;
        let before = cache.len();
        cache.retain(|_, cached| cached.created_at.elapsed() < self.ttl);
        before - cache.len()
    }
}
