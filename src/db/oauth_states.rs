use super::{Database, now, text_column};
use crate::models::OAuthState;
use sqlx::Row;

impl Database {
    pub async fn create_oauth_state(&self, state: &OAuthState) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO oauth_states (state, user_id, marketplace, code_verifier, expires_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&state.state)
        .bind(&state.user_id)
        .bind(state.marketplace.as_str())
        .bind(&state.code_verifier)
        .bind(state.expires_at)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_oauth_state(&self, state: &str) -> Result<Option<OAuthState>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT state, user_id, marketplace, code_verifier, expires_at FROM oauth_states WHERE state = ?",
        )
        .bind(state)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(OAuthState {
            state: row.try_get("state")?,
            user_id: row.try_get("user_id")?,
            marketplace: text_column(&row, "marketplace")?,
            code_verifier: row.try_get("code_verifier")?,
            expires_at: row.try_get("expires_at")?,
        }))
    }

    pub async fn delete_oauth_state(&self, state: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM oauth_states WHERE state = ?")
            .bind(state)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Deletes every state past its expiry and returns how many went.
    pub async fn purge_expired_oauth_states(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM oauth_states WHERE expires_at < ?")
            .bind(now())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
