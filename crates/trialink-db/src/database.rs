//! Database connection and table management.
//!
//! Provides a unified interface over the SQLite pool.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::debug;

use crate::error::Result;
use crate::schema;

/// Main database handle.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    url: String,
}

impl Database {
    /// Open a database by sqlx URL, e.g. `sqlite://data/trialink.db` or
    /// `sqlite::memory:`. File databases are created if missing.
    pub async fn open(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // Every in-memory connection is its own database; keep exactly one alive.
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new().max_connections(4).connect_with(options).await?
        };

        debug!(url, "database opened");
        Ok(Self { pool, url: url.to_string() })
    }

    /// Open or create a database file, creating its parent directory.
    pub async fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::open(&format!("sqlite://{}", path.to_string_lossy())).await
    }

    /// In-memory database, initialized.
    pub async fn in_memory() -> Result<Self> {
        let db = Self::open("sqlite::memory:").await?;
        db.initialize().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Create all tables if they don't exist.
    pub async fn initialize(&self) -> Result<()> {
        for ddl in [schema::CREATE_STUDIES, schema::CREATE_ENDPOINTS, schema::CREATE_BASELINE_MEASURES] {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn table_exists(&self, name: &str) -> Result<bool> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")? > 0)
    }

    async fn count_rows(&self, table: &str) -> Result<u64> {
        if !self.table_exists(table).await? {
            return Ok(0);
        }
        // Table names come from the schema constants only.
        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }

    /// Get table statistics.
    pub async fn stats(&self) -> Result<DatabaseStats> {
        Ok(DatabaseStats {
            studies: self.count_rows(schema::TABLE_STUDIES).await?,
            endpoints: self.count_rows(schema::TABLE_ENDPOINTS).await?,
            baseline_measures: self.count_rows(schema::TABLE_BASELINE_MEASURES).await?,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Database statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatabaseStats {
    pub studies: u64,
    pub endpoints: u64,
    pub baseline_measures: u64,
}
