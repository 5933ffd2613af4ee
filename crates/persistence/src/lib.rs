//! Persistence layer for peer benchmarking
//!
//! SQLite storage for benchmark records, peer group snapshots, the refresh
//! job queue and the latest upstream score inputs per address.

pub mod repository;
pub mod schema;

pub use sqlx::sqlite::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type DbResult<T> = Result<T, DbError>;

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database file and bring the schema up to date
    pub async fn new(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| DbError::Connection(e.to_string()))?;

        let db = Self { pool };
        db.run_migrations().await?;
        db.configure_pragmas().await?;
        info!(path = %path.display(), "Database opened");

        Ok(db)
    }

    /// Create an in-memory database (for testing)
    ///
    /// Single connection: every pooled connection to `sqlite::memory:` would
    /// otherwise see its own empty database.
    pub async fn in_memory() -> DbResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| DbError::Connection(e.to_string()))?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run database migrations (execute each statement individually)
    async fn run_migrations(&self) -> DbResult<()> {
        for statement in schema::CREATE_TABLES.split(';') {
            // Strip comment-only lines, then check if any SQL remains
            let sql: String = statement
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");
            let sql = sql.trim();
            if sql.is_empty() {
                continue;
            }
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| DbError::Migration(format!("{e}: {sql}")))?;
        }

        for migration in schema::MIGRATIONS {
            if let Err(e) = sqlx::query(migration).execute(&self.pool).await {
                if !e.to_string().contains("duplicate column name") {
                    return Err(DbError::Migration(format!("{e}: {migration}")));
                }
                debug!(migration, "Migration already applied");
            }
        }

        Ok(())
    }

    async fn configure_pragmas(&self) -> DbResult<()> {
        // WAL mode: readers keep seeing the last committed record during a tick
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| DbError::Connection(format!("WAL pragma failed: {e}")))?;

        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| DbError::Connection(format!("synchronous pragma failed: {e}")))?;

        sqlx::query("PRAGMA busy_timeout=5000")
            .execute(&self.pool)
            .await
            .map_err(|e| DbError::Connection(format!("busy_timeout pragma failed: {e}")))?;

        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Clone the pool for use in spawned tasks
    pub fn pool_clone(&self) -> SqlitePool {
        self.pool.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let db = Database::in_memory().await.unwrap();
        db.run_migrations().await.unwrap();

        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
             ('benchmark_records', 'peer_group_snapshots', 'benchmark_jobs', 'address_inputs')",
        )
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!(count, 4);
    }
}
