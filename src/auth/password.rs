use crate::error::AppError;
use tokio::sync::OnceCell;

/// bcrypt hashing on the blocking pool.
pub struct PasswordHasher {
    cost: u32,
    dummy: OnceCell<String>,
}

impl PasswordHasher {
    pub fn new(cost: u32) -> Self {
        Self {
            cost,
            dummy: OnceCell::new(),
        }
    }

    pub async fn hash(&self, password: &str) -> Result<String, AppError> {
        let password = password.to_string();
        let cost = self.cost;
        tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
            .await
            .map_err(|err| AppError::internal(format!("hash task: {err}")))?
            .map_err(|err| AppError::internal(format!("bcrypt hash: {err}")))
    }

    /// A malformed stored hash counts as a mismatch.
    pub async fn verify(&self, password: &str, hash: &str) -> Result<bool, AppError> {
        let password = password.to_string();
        let hash = hash.to_string();
        tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash).unwrap_or(false))
            .await
            .map_err(|err| AppError::internal(format!("verify task: {err}")))
    }

    /// Burns a full verification against a throwaway hash so unknown
    /// accounts take as long as wrong passwords.
    pub async fn verify_dummy(&self, password: &str) -> Result<(), AppError> {
        let dummy = self
            .dummy
            .get_or_try_init(|| self.hash("not-a-real-account-password"))
            .await?;
        self.verify(password, dummy).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_and_verify() {
        let hasher = PasswordHasher::new(4);
        let hash = hasher.hash("Sideboard123").await.expect("hash");
        assert!(hash.starts_with("$2"));
        assert!(hasher.verify("Sideboard123", &hash).await.expect("verify"));
        assert!(!hasher.verify("sideboard123", &hash).await.expect("verify"));
    }

    #[tokio::test]
    async fn garbage_hash_is_a_mismatch() {
        let hasher = PasswordHasher::new(4);
        assert!(!hasher.verify("anything", "not-bcrypt").await.expect("verify"));
        hasher.verify_dummy("anything").await.expect("dummy");
    }
}
