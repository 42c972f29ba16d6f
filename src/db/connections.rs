use super::{Database, new_id, now, text_column};
use crate::models::{ConnectionStatus, Marketplace, MarketplaceConnection};
use chrono::{DateTime, Utc};
use sqlx::{Row, sqlite::SqliteRow};

const CONNECTION_COLUMNS: &str = "id, user_id, marketplace, status, access_token, refresh_token, \
     token_expires_at, last_sync_at, created_at, updated_at";

fn connection_from_row(row: &SqliteRow) -> Result<MarketplaceConnection, sqlx::Error> {
    Ok(MarketplaceConnection {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        marketplace: text_column(row, "marketplace")?,
        status: text_column(row, "status")?,
        access_token: row.try_get("access_token")?,
        refresh_token: row.try_get("refresh_token")?,
        token_expires_at: row.try_get("token_expires_at")?,
        last_sync_at: row.try_get("last_sync_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Tokens returned by a marketplace token endpoint.
#[derive(Debug, Clone)]
pub struct StoredTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Database {
    pub async fn list_connections(
        &self,
        user_id: &str,
    ) -> Result<Vec<MarketplaceConnection>, sqlx::Error> {
        let sql = format!(
            "SELECT {CONNECTION_COLUMNS} FROM marketplace_connections WHERE user_id = ? ORDER BY marketplace"
        );
        let rows = sqlx::query(&sql).bind(user_id).fetch_all(&self.pool).await?;
        rows.iter().map(connection_from_row).collect()
    }

    pub async fn find_connection(
        &self,
        user_id: &str,
        marketplace: Marketplace,
    ) -> Result<Option<MarketplaceConnection>, sqlx::Error> {
        let sql = format!(
            "SELECT {CONNECTION_COLUMNS} FROM marketplace_connections WHERE user_id = ? AND marketplace = ?"
        );
        sqlx::query(&sql)
            .bind(user_id)
            .bind(marketplace.as_str())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(connection_from_row)
            .transpose()
    }

    /// Marks a browser-automated marketplace as connected without tokens.
    pub async fn upsert_connection_status(
        &self,
        user_id: &str,
        marketplace: Marketplace,
        status: ConnectionStatus,
    ) -> Result<MarketplaceConnection, sqlx::Error> {
        let ts = now();
        sqlx::query(
            "INSERT INTO marketplace_connections (id, user_id, marketplace, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (user_id, marketplace) DO UPDATE SET
                status = excluded.status,
                updated_at = excluded.updated_at",
        )
        .bind(new_id())
        .bind(user_id)
        .bind(marketplace.as_str())
        .bind(status.as_str())
        .bind(ts)
        .bind(ts)
        .execute(&self.pool)
        .await?;
        self.find_connection(user_id, marketplace)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    /// Stores a freshly exchanged token set and marks the connection connected.
    pub async fn store_tokens(
        &self,
        user_id: &str,
        marketplace: Marketplace,
        tokens: &StoredTokens,
    ) -> Result<MarketplaceConnection, sqlx::Error> {
        let ts = now();
        sqlx::query(
            "INSERT INTO marketplace_connections (id, user_id, marketplace, status, access_token,
                refresh_token, token_expires_at, created_at, updated_at)
             VALUES (?, ?, ?, 'connected', ?, ?, ?, ?, ?)
             ON CONFLICT (user_id, marketplace) DO UPDATE SET
                status = 'connected',
                access_token = excluded.access_token,
                refresh_token = COALESCE(excluded.refresh_token, marketplace_connections.refresh_token),
                token_expires_at = excluded.token_expires_at,
                updated_at = excluded.updated_at",
        )
        .bind(new_id())
        .bind(user_id)
        .bind(marketplace.as_str())
        .bind(&tokens.access_token)
        .bind(&tokens.refresh_token)
        .bind(tokens.expires_at)
        .bind(ts)
        .bind(ts)
        .execute(&self.pool)
        .await?;
        self.find_connection(user_id, marketplace)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn set_connection_status(&self, id: &str, status: ConnectionStatus) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE marketplace_connections SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn touch_connection_sync(&self, id: &str) -> Result<(), sqlx::Error> {
        let ts = now();
        sqlx::query("UPDATE marketplace_connections SET last_sync_at = ?, updated_at = ? WHERE id = ?")
            .bind(ts)
            .bind(ts)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Returns `false` when there was nothing to delete.
    pub async fn delete_connection(
        &self,
        user_id: &str,
        marketplace: Marketplace,
    ) -> Result<bool, sqlx::Error> {
        let result =
            sqlx::query("DELETE FROM marketplace_connections WHERE user_id = ? AND marketplace = ?")
                .bind(user_id)
                .bind(marketplace.as_str())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }
}
