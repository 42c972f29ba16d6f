use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;

pub const REVOCATION_TTL: Duration = super::jwt::REFRESH_TTL;

/// Revoked refresh tokens, held as SHA-256 digests until they could no
/// longer be used anyway. Lost on restart.
pub struct RevocationList {
    entries: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl Default for RevocationList {
    fn default() -> Self {
        Self::with_ttl(REVOCATION_TTL)
    }
}

fn digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

impl RevocationList {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn revoke(&self, token: &str) {
        self.entries
            .lock()
            .await
            .insert(digest(token), Instant::now() + self.ttl);
    }

    /// Revokes `token` unless it already is. Returns `true` for the caller that
    /// revoked it, so a token rotates at most once.
    pub async fn revoke_if_absent(&self, token: &str) -> bool {
        let key = digest(token);
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if entries.get(&key).is_some_and(|expiry| now <= *expiry) {
            return false;
        }
        entries.insert(key, now + self.ttl);
        true
    }

    /// Expired entries read as not revoked and are dropped on the spot.
    pub async fn is_revoked(&self, token: &str) -> bool {
        let key = digest(token);
        let mut entries = self.entries.lock().await;
        match entries.get(&key) {
            Some(expiry) if Instant::now() > *expiry => {
                entries.remove(&key);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, expiry| *expiry >= now);
        before - entries.len()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn revoked_tokens_are_remembered_by_digest() {
        let list = RevocationList::default();
        list.revoke("token-a").await;
        assert!(list.is_revoked("token-a").await);
        assert!(!list.is_revoked("token-b").await);
        let entries = list.entries.lock().await;
        assert!(entries.keys().all(|k| k.len() == 64 && k != "token-a"));
    }

    #[tokio::test]
    async fn only_one_concurrent_revoke_wins() {
        let list = std::sync::Arc::new(RevocationList::default());
        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let list = list.clone();
                tokio::spawn(async move { list.revoke_if_absent("refresh-1").await })
            })
            .collect();
        let mut winners = 0;
        for attempt in attempts {
            if attempt.await.expect("join") {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(list.is_revoked("refresh-1").await);
    }

    #[tokio::test]
    async fn expired_revocation_can_be_taken_again() {
        let list = RevocationList::with_ttl(Duration::from_millis(5));
        assert!(list.revoke_if_absent("a").await);
        assert!(!list.revoke_if_absent("a").await);
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(list.revoke_if_absent("a").await);
    }

    #[tokio::test]
    async fn expired_entries_are_purged() {
        let list = RevocationList::with_ttl(Duration::from_millis(5));
        list.revoke("a").await;
        list.revoke("b").await;
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(!list.is_revoked("a").await);
        assert_eq!(list.len().await, 1);
        assert_eq!(list.purge_expired().await, 1);
        assert_eq!(list.len().await, 0);
    }
}
