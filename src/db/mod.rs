mod connections;
mod listings;
mod oauth_states;
mod users;

pub use connections::StoredTokens;
pub use listings::{
    DeleteOutcome, ListingChanges, ListingQuery, MarketplaceListingUpdate,
    NewListing, SyncCandidate,
};

use crate::models::UnknownVariant;
use chrono::Utc;
use sqlx::{
    Sqlite, SqlitePool,
    migrate::MigrateDatabase,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Row,
};
use std::str::FromStr;
use tracing::info;

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        if !url.contains(":memory:") && !Sqlite::database_exists(url).await.unwrap_or(false) {
            if let Some(parent) = url
                .trim_start_matches("sqlite://")
                .trim_start_matches("sqlite:")
                .rsplit_once('/')
                .map(|(dir, _)| dir)
                .filter(|dir| !dir.is_empty())
            {
                std::fs::create_dir_all(parent)?;
            }
            info!(target = "syncsellr.db", url, "creating database file");
            Sqlite::create_database(url).await?;
        }

        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        info!(target = "syncsellr.db", "database initialized");
        Ok(db)
    }

    /// Private in-memory database on a single pinned connection.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| sqlx::Error::Migrate(Box::new(err)))
    }

    #[cfg(test)]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn now() -> chrono::DateTime<Utc> {
    Utc::now()
}

/// Reads a TEXT column into one of the closed string enums.
pub(crate) fn text_column<T>(row: &SqliteRow, column: &str) -> Result<T, sqlx::Error>
where
    T: FromStr<Err = UnknownVariant>,
{
    let raw: String = row.try_get(column)?;
    T::from_str(&raw).map_err(|err| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(err),
    })
}

pub(crate) fn optional_text_column<T>(row: &SqliteRow, column: &str) -> Result<Option<T>, sqlx::Error>
where
    T: FromStr<Err = UnknownVariant>,
{
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|value| {
        T::from_str(&value).map_err(|err| sqlx::Error::ColumnDecode {
            index: column.to_string(),
            source: Box::new(err),
        })
    })
    .transpose()
}

pub(crate) fn json_column<T>(row: &SqliteRow, column: &str) -> Result<Option<T>, sqlx::Error>
where
    T: serde::de::DeserializeOwned,
{
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|value| {
        serde_json::from_str(&value).map_err(|err| sqlx::Error::ColumnDecode {
            index: column.to_string(),
            source: Box::new(err),
        })
    })
    .transpose()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Database;
    use crate::models::User;

    pub async fn database() -> Database {
        Database::in_memory().await.expect("in-memory database")
    }

    pub async fn user(db: &Database, email: &str) -> User {
        db.create_user(email, "$2b$04$not-a-real-hash", "Test Seller")
            .await
            .expect("create user")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_apply_and_ping_succeeds() {
        let db = Database::in_memory().await.expect("db");
        assert!(db.ping().await);
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE '\\_%' ESCAPE '\\' ORDER BY name",
        )
        .fetch_all(db.pool())
        .await
        .expect("tables");
        for expected in [
            "listing_images",
            "listings",
            "marketplace_connections",
            "marketplace_listings",
            "oauth_states",
            "users",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn file_database_is_created_on_demand() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("app.db");
        let url = format!("sqlite:{}", path.display());
        let db = Database::connect(&url).await.expect("connect");
        assert!(db.ping().await);
        assert!(path.exists());
        db.close().await;
    }
}
