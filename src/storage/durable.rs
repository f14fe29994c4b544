/// Durable backend - SQLite key-value table
use crate::error::EngineResult;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

/// Durable per-origin key-value store backed by SQLite
#[derive(Clone)]
pub struct DurableBackend {
    db: SqlitePool,
}

impl DurableBackend {
    /// Open the database and ensure the kv table exists
    pub async fn open(url: &str) -> EngineResult<Self> {
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&db)
        .await?;

        Ok(Self { db })
    }

    /// Build a backend around an existing pool (tests)
    pub fn from_pool(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Get a value by key
    pub async fn get(&self, key: &str) -> EngineResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.db)
            .await?;

        match row {
            Some(row) => Ok(Some(row.try_get("value")?)),
            None => Ok(None),
        }
    }

    /// Upsert a value
    pub async fn set(&self, key: &str, value: &str) -> EngineResult<()> {
        let now = chrono::Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO kv (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(&now)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Delete a key
    pub async fn remove(&self, key: &str) -> EngineResult<()> {
        sqlx::query("DELETE FROM kv WHERE key = ?1")
            .bind(key)
            .execute(&self.db)
            .await?;

        Ok(())
    }
}
