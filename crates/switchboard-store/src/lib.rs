use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions, SqlitePool};
use std::str::FromStr;
use tracing::{info, instrument};

/// One stored OAuth connection between a dashboard user and a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Integration {
    pub id: i64,
    pub user_id: String,
    pub provider: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub webhook_url: Option<String>,
    pub merge_account_token: Option<String>,
    pub merge_account_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Integration {
    pub fn has_access_token(&self) -> bool {
        self.access_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// Token fields written on connect and on refresh.
#[derive(Debug, Clone, Default)]
pub struct TokenUpdate {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

type IntegrationRow = (
    i64,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    String,
);

const SELECT_COLUMNS: &str = "SELECT id, user_id, provider, access_token, refresh_token, expires_at, \
    webhook_url, merge_account_token, merge_account_id, created_at, updated_at FROM integrations";

#[derive(Clone)]
pub struct IntegrationStore {
    pool: SqlitePool,
}

impl IntegrationStore {
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::from_str("sqlite:")?
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
        let store = Self { pool };
        store.init_schema().await?;
        info!("integration store ready at {}", db_path.display());
        Ok(store)
    }

    /// Private in-memory database. A single connection keeps every query on
    /// the same database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    #[instrument(skip_all)]
    async fn init_schema(&self) -> Result<()> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS integrations (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                user_id TEXT NOT NULL,\
                provider TEXT NOT NULL,\
                access_token TEXT,\
                refresh_token TEXT,\
                expires_at TEXT,\
                webhook_url TEXT,\
                merge_account_token TEXT,\
                merge_account_id TEXT,\
                created_at TEXT NOT NULL,\
                updated_at TEXT NOT NULL,\
                UNIQUE(user_id, provider)\
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Create or update the user's row for `provider` after a successful
    /// authorization. A missing refresh token keeps the stored one.
    #[instrument(skip(self, update))]
    pub async fn upsert_tokens(
        &self,
        user_id: &str,
        provider: &str,
        update: &TokenUpdate,
    ) -> Result<Integration> {
        let now = Utc::now().to_rfc3339();
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO integrations (user_id, provider, access_token, refresh_token, expires_at, created_at, updated_at) \
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6) \
            ON CONFLICT(user_id, provider) DO UPDATE SET \
                access_token=excluded.access_token, \
                refresh_token=COALESCE(excluded.refresh_token, integrations.refresh_token), \
                expires_at=excluded.expires_at, \
                updated_at=excluded.updated_at \
            RETURNING id",
        )
        .bind(user_id)
        .bind(provider)
        .bind(&update.access_token)
        .bind(&update.refresh_token)
        .bind(update.expires_at.map(|dt| dt.to_rfc3339()))
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;

        self.get_by_id(id)
            .await?
            .context("integration vanished after upsert")
    }

    /// Persist refreshed tokens. Returns false when the row no longer exists.
    #[instrument(skip(self, update))]
    pub async fn update_tokens(
        &self,
        user_id: &str,
        provider: &str,
        update: &TokenUpdate,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE integrations SET \
                access_token = ?3, \
                refresh_token = COALESCE(?4, refresh_token), \
                expires_at = ?5, \
                updated_at = ?6 \
            WHERE user_id = ?1 AND provider = ?2",
        )
        .bind(user_id)
        .bind(provider)
        .bind(&update.access_token)
        .bind(&update.refresh_token)
        .bind(update.expires_at.map(|dt| dt.to_rfc3339()))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_webhook_url(
        &self,
        user_id: &str,
        provider: &str,
        webhook_url: &str,
    ) -> Result<Integration> {
        let now = Utc::now().to_rfc3339();
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO integrations (user_id, provider, webhook_url, created_at, updated_at) \
            VALUES (?1, ?2, ?3, ?4, ?4) \
            ON CONFLICT(user_id, provider) DO UPDATE SET \
                webhook_url=excluded.webhook_url, \
                updated_at=excluded.updated_at \
            RETURNING id",
        )
        .bind(user_id)
        .bind(provider)
        .bind(webhook_url)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;

        self.get_by_id(id)
            .await?
            .context("integration vanished after webhook update")
    }

    pub async fn set_merge_account(
        &self,
        user_id: &str,
        provider: &str,
        account_token: &str,
        account_id: Option<&str>,
    ) -> Result<Integration> {
        let now = Utc::now().to_rfc3339();
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO integrations (user_id, provider, merge_account_token, merge_account_id, created_at, updated_at) \
            VALUES (?1, ?2, ?3, ?4, ?5, ?5) \
            ON CONFLICT(user_id, provider) DO UPDATE SET \
                merge_account_token=excluded.merge_account_token, \
                merge_account_id=excluded.merge_account_id, \
                updated_at=excluded.updated_at \
            RETURNING id",
        )
        .bind(user_id)
        .bind(provider)
        .bind(account_token)
        .bind(account_id)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;

        self.get_by_id(id)
            .await?
            .context("integration vanished after merge account update")
    }

    pub async fn get(&self, user_id: &str, provider: &str) -> Result<Option<Integration>> {
        let row = sqlx::query_as::<_, IntegrationRow>(&format!(
            "{} WHERE user_id = ?1 AND provider = ?2",
            SELECT_COLUMNS
        ))
        .bind(user_id)
        .bind(provider)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(integration_from_row))
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Integration>> {
        let row = sqlx::query_as::<_, IntegrationRow>(&format!("{} WHERE id = ?1", SELECT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(integration_from_row))
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<Integration>> {
        let rows = sqlx::query_as::<_, IntegrationRow>(&format!(
            "{} WHERE user_id = ?1 ORDER BY provider",
            SELECT_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(integration_from_row).collect())
    }

    /// Remove the user's row for `provider`. Returns false when nothing was stored.
    pub async fn delete(&self, user_id: &str, provider: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM integrations WHERE user_id = ?1 AND provider = ?2")
            .bind(user_id)
            .bind(provider)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn integration_from_row(row: IntegrationRow) -> Integration {
    let (
        id,
        user_id,
        provider,
        access_token,
        refresh_token,
        expires_at,
        webhook_url,
        merge_account_token,
        merge_account_id,
        created_at,
        updated_at,
    ) = row;
    Integration {
        id,
        user_id,
        provider,
        access_token,
        refresh_token,
        expires_at: expires_at.as_deref().and_then(parse_timestamp),
        webhook_url,
        merge_account_token,
        merge_account_id,
        created_at: parse_timestamp(&created_at).unwrap_or_else(Utc::now),
        updated_at: parse_timestamp(&updated_at).unwrap_or_else(Utc::now),
    }
}
