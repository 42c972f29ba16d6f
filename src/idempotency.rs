use crate::cache::Cache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

pub const HEADER: &str = "idempotency-key";
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const MAX_KEY_LEN: usize = 255;

/// A response captured the first time a keyed request succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    pub body: Value,
}

/// Replays responses for repeated `Idempotency-Key` requests, per user.
#[derive(Clone)]
pub struct IdempotencyStore {
    cache: Cache,
    ttl: Duration,
}

fn cache_key(user_id: &str, key: &str) -> String {
    format!("idempotency:{user_id}:{key}")
}

/// Blank or oversized keys are ignored rather than rejected.
pub fn normalize_key(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|k| !k.is_empty() && k.len() <= MAX_KEY_LEN)
        .map(str::to_string)
}

impl IdempotencyStore {
    pub fn new(cache: Cache, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    pub async fn lookup(&self, user_id: &str, key: &str) -> Option<StoredResponse> {
        let hit = self.cache.get_json(&cache_key(user_id, key)).await;
        if hit.is_some() {
            debug!(target = "syncsellr.api", user_id, key, "idempotent replay");
        }
        hit
    }

    pub async fn remember(&self, user_id: &str, key: &str, status: u16, body: &Value) {
        let stored = StoredResponse {
            status,
            body: body.clone(),
        };
        self.cache
            .set_json(&cache_key(user_id, key), &stored, Some(self.ttl))
            .await;
    }
}
