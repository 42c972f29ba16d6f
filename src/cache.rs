use redis::AsyncCommands;
use serde::{Serialize, de::DeserializeOwned};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Key-value cache backed by Redis when available, with an in-process map behind it.
#[derive(Clone, Default)]
pub struct Cache {
    redis: Option<redis::Client>,
    local: Arc<Mutex<HashMap<String, LocalEntry>>>,
}

struct LocalEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl LocalEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

impl Cache {
    pub fn new(redis_url: Option<&str>) -> Self {
        let redis = match redis_url {
            None => {
                warn!(target = "syncsellr.cache", "REDIS_URL not set; using in-process cache");
                None
            }
            Some(url) => match redis::Client::open(url) {
                Ok(client) => {
                    info!(target = "syncsellr.cache", "redis cache configured");
                    Some(client)
                }
                Err(err) => {
                    warn!(target = "syncsellr.cache", error = %err, "invalid REDIS_URL; using in-process cache");
                    None
                }
            },
        };
        Self {
            redis,
            local: Arc::default(),
        }
    }

    pub fn in_memory() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        if let Some(client) = &self.redis {
            match redis_get(client, key).await {
                Ok(Some(value)) => return Some(value),
                Ok(None) => {}
                Err(err) => debug!(target = "syncsellr.cache", key, error = %err, "redis get failed"),
            }
        }
        let mut local = self.local.lock().await;
        let now = Instant::now();
        match local.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                local.remove(key);
                None
            }
            None => None,
        }
    }

    pub async fn set(&self, key: &str, value: String, ttl: Option<Duration>) {
        if let Some(client) = &self.redis {
            match redis_set(client, key, &value, ttl).await {
                Ok(()) => return,
                Err(err) => debug!(target = "syncsellr.cache", key, error = %err, "redis set failed"),
            }
        }
        let entry = LocalEntry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.local.lock().await.insert(key.to_string(), entry);
    }

    pub async fn del(&self, key: &str) {
        if let Some(client) = &self.redis
            && let Err(err) = redis_del(client, key).await
        {
            debug!(target = "syncsellr.cache", key, error = %err, "redis del failed");
        }
        self.local.lock().await.remove(key);
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key)
            .await
            .and_then(|raw| serde_json::from_str(&raw).ok())
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        match serde_json::to_string(value) {
            Ok(json) => self.set(key, json, ttl).await,
            Err(err) => warn!(target = "syncsellr.cache", key, error = %err, "cache encode failed"),
        }
    }

    /// Drops expired in-process entries.
    pub async fn purge_expired(&self) -> usize {
        let mut local = self.local.lock().await;
        let now = Instant::now();
        let before = local.len();
        local.retain(|_, entry| entry.is_live(now));
        before - local.len()
    }
}

async fn redis_get(client: &redis::Client, key: &str) -> redis::RedisResult<Option<String>> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    conn.get(key).await
}

async fn redis_set(
    client: &redis::Client,
    key: &str,
    value: &str,
    ttl: Option<Duration>,
) -> redis::RedisResult<()> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    match ttl {
        Some(ttl) => conn.set_ex(key, value, ttl.as_secs().max(1)).await,
        None => conn.set(key, value).await,
    }
}

async fn redis_del(client: &redis::Client, key: &str) -> redis::RedisResult<()> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    conn.del(key).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Snapshot {
        status: String,
    }

    #[tokio::test]
    async fn local_cache_round_trip() {
        let cache = Cache::in_memory();
        cache
            .set_json("probe:vinted", &Snapshot { status: "healthy".into() }, None)
            .await;
        let loaded: Option<Snapshot> = cache.get_json("probe:vinted").await;
        assert_eq!(loaded, Some(Snapshot { status: "healthy".into() }));
        cache.del("probe:vinted").await;
        assert!(cache.get("probe:vinted").await.is_none());
    }

    #[tokio::test]
    async fn entries_expire() {
        let cache = Cache::in_memory();
        cache
            .set("short", "1".into(), Some(Duration::from_millis(20)))
            .await;
        cache.set("long", "2".into(), None).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("short").await.is_none());
        assert_eq!(cache.get("long").await.as_deref(), Some("2"));
        assert_eq!(cache.purge_expired().await, 0);
    }

    #[tokio::test]
    async fn unreachable_redis_falls_back_silently() {
        let cache = Cache::new(Some("redis://127.0.0.1:1/"));
        cache.set("k", "v".into(), Some(Duration::from_secs(5))).await;
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
    }
}
