use super::{Database, json_column, new_id, now};
use crate::models::User;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{Row, sqlite::SqliteRow};

const USER_COLUMNS: &str = "id, email, password_hash, name, subscription_tier, \
     onboarding_completed_at, cross_list_reminders, created_at, updated_at";

fn user_from_row(row: &SqliteRow) -> Result<User, sqlx::Error> {
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        name: row.try_get("name")?,
        subscription_tier: row.try_get("subscription_tier")?,
        onboarding_completed_at: row.try_get("onboarding_completed_at")?,
        cross_list_reminders: json_column(row, "cross_list_reminders")?.unwrap_or_default(),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl Database {
    pub async fn create_user(
        &self,
        email: &str,
        password_hash: &str,
        name: &str,
    ) -> Result<User, sqlx::Error> {
        let id = new_id();
        let ts = now();
        sqlx::query(
            "INSERT INTO users (id, email, password_hash, name, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(email)
        .bind(password_hash)
        .bind(name)
        .bind(ts)
        .bind(ts)
        .execute(&self.pool)
        .await?;
        self.find_user(&id).await?.ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn find_user(&self, id: &str) -> Result<Option<User>, sqlx::Error> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?");
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(user_from_row)
            .transpose()
    }

    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, sqlx::Error> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?");
        sqlx::query(&sql)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(user_from_row)
            .transpose()
    }

    /// Stamps onboarding as complete. Returns `None` when the user does not exist.
    pub async fn complete_onboarding(
        &self,
        user_id: &str,
    ) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
        let ts = now();
        let result = sqlx::query(
            "UPDATE users SET onboarding_completed_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(ts)
        .bind(ts)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok((result.rows_affected() > 0).then_some(ts))
    }

    /// Merges `changes` into the stored reminder map and returns the result.
    pub async fn merge_reminders(
        &self,
        user_id: &str,
        changes: Map<String, Value>,
    ) -> Result<Option<Map<String, Value>>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let raw: Option<String> =
            sqlx::query_scalar("SELECT cross_list_reminders FROM users WHERE id = ?")
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let mut merged: Map<String, Value> = serde_json::from_str(&raw).unwrap_or_default();
        merged.extend(changes);
        let encoded = Value::Object(merged.clone()).to_string();
        sqlx::query("UPDATE users SET cross_list_reminders = ?, updated_at = ? WHERE id = ?")
            .bind(encoded)
            .bind(now())
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(merged))
    }
}
