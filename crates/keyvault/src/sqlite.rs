//! SQLite vault backed by `sqlx`.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::error::{Result, VaultError};
use crate::key::{ContentKey, KeyId};
use crate::vault::{PutOutcome, Vault, compare_existing};

/// Default busy timeout in milliseconds.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

/// Default connection pool size.
const DEFAULT_POOL_SIZE: u32 = 4;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS content_keys (
    scope TEXT NOT NULL,
    kid TEXT NOT NULL,
    key TEXT NOT NULL,
    added_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (scope, kid)
)
"#;

pub struct SqliteVault {
    name: String,
    pool: SqlitePool,
}

impl SqliteVault {
    /// Opens (and creates if missing) a vault database.
    ///
    /// # Arguments
    /// * `database_url` - SQLite database URL (e.g., "sqlite:keys.db")
    pub async fn connect(database_url: &str) -> Result<Self> {
        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            // FULL so a returned insert survives power loss
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_POOL_SIZE)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(connect_options)
            .await?;

        let vault = Self::from_pool(database_url, pool).await?;
        info!(vault = %vault.name, "SQLite vault ready");
        Ok(vault)
    }

    /// A private in-memory database. Single connection, since every SQLite
    /// memory connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool("sqlite::memory:", pool).await
    }

    async fn from_pool(name: &str, pool: SqlitePool) -> Result<Self> {
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self {
            name: name.trim_start_matches("sqlite:").to_string(),
            pool,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn decode_key(&self, kid: &KeyId, raw: &str) -> Result<ContentKey> {
        let key = hex::decode(raw).map_err(|e| {
            VaultError::storage(format!("corrupt entry for {kid} in {}: {e}", self.name))
        })?;
        Ok(ContentKey::new(*kid, key))
    }
}

#[async_trait]
impl Vault for SqliteVault {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, scope: &str, kid: &KeyId) -> Result<Option<ContentKey>> {
        let row = sqlx::query("SELECT key FROM content_keys WHERE scope = ? AND kid = ?")
            .bind(scope)
            .bind(kid.to_hex())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let raw: String = row.try_get("key")?;
                self.decode_key(kid, &raw).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, scope: &str, key: &ContentKey) -> Result<PutOutcome> {
        // The primary key makes the insert atomic: a concurrent writer either
        // wins the row or observes it.
        let result = sqlx::query(
            r#"
            INSERT INTO content_keys (scope, kid, key) VALUES (?, ?, ?)
            ON CONFLICT (scope, kid) DO NOTHING
            "#,
        )
        .bind(scope)
        .bind(key.kid().to_hex())
        .bind(key.key_hex())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            debug!(vault = %self.name, kid = %key.kid(), scope, "Stored content key");
            return Ok(PutOutcome::Inserted);
        }

        let existing = self.get(scope, key.kid()).await?.ok_or_else(|| {
            VaultError::storage(format!(
                "insert of {} was ignored but no row exists in {}",
                key.kid(),
                self.name
            ))
        })?;
        compare_existing(&self.name, existing.key(), key)
    }

    async fn list(&self, scope: &str) -> Result<Vec<ContentKey>> {
        let rows = sqlx::query("SELECT kid, key FROM content_keys WHERE scope = ? ORDER BY kid")
            .bind(scope)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let kid: String = row.try_get("kid")?;
                let key: String = row.try_get("key")?;
                let kid: KeyId = kid.parse()?;
                self.decode_key(&kid, &key)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(kid: u8, value: u8) -> ContentKey {
        ContentKey::new(KeyId::from_bytes([kid; 16]), vec![value; 16])
    }

    #[tokio::test]
    async fn insert_then_lookup() {
        let vault = SqliteVault::in_memory().await.unwrap();
        assert_eq!(vault.put("clearkey", &key(1, 2)).await.unwrap(), PutOutcome::Inserted);

        let found = vault
            .get("clearkey", &KeyId::from_bytes([1; 16]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, key(1, 2));
    }

    #[tokio::test]
    async fn duplicate_insert_is_unchanged_and_conflict_rejected() {
        let vault = SqliteVault::in_memory().await.unwrap();
        vault.put("clearkey", &key(1, 2)).await.unwrap();

        assert_eq!(vault.put("clearkey", &key(1, 2)).await.unwrap(), PutOutcome::Unchanged);
        let err = vault.put("clearkey", &key(1, 3)).await.unwrap_err();
        assert!(err.is_conflict());

        let listed = vault.list("clearkey").await.unwrap();
        assert_eq!(listed, vec![key(1, 2)]);
    }

    #[tokio::test]
    async fn file_database_survives_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("keys.db").display());

        let vault = SqliteVault::connect(&url).await.unwrap();
        vault.put("widevine", &key(5, 6)).await.unwrap();
        vault.close().await;

        let reopened = SqliteVault::connect(&url).await.unwrap();
        let found = reopened
            .get("widevine", &KeyId::from_bytes([5; 16]))
            .await
            .unwrap();
        assert_eq!(found, Some(key(5, 6)));
    }
}
