//! Database module for SQLite persistence.
//!
//! SQLite is the durable home of records, the sync queue, cached tiles and area
//! downloads. Every public operation runs as its own statement or transaction.

mod queue;
mod records;
mod tiles;

pub use queue::*;
pub use records::*;
pub use tiles::*;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use crate::errors::AppError;

/// Initialize the database connection pool and run migrations.
pub async fn init_database(db_path: &Path) -> Result<SqlitePool, sqlx::Error> {
    // Ensure the parent directory exists
    if let Some(parent) = db_path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }

    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .busy_timeout(std::time::Duration::from_secs(30));

    // One connection makes every call a single-writer transaction and avoids
    // "database is locked" errors between the UI, the sync engine and tile writes.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    // Run embedded migrations
    run_migrations(&pool).await?;

    Ok(pool)
}

/// Run database migrations.
async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            id TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL,
            server_id TEXT,
            payload TEXT NOT NULL,
            sync_status TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            deleted INTEGER NOT NULL DEFAULT 0
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_queue (
            id TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            payload TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL,
            last_attempt INTEGER,
            error_message TEXT,
            created_at INTEGER NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            revision INTEGER NOT NULL DEFAULT 1,
            UNIQUE (entity_type, entity_id)
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tiles (
            zoom INTEGER NOT NULL,
            x INTEGER NOT NULL,
            y INTEGER NOT NULL,
            layer TEXT NOT NULL,
            tile_data BLOB NOT NULL,
            size_bytes INTEGER NOT NULL,
            last_accessed INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            PRIMARY KEY (zoom, x, y, layer)
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS area_downloads (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            south REAL NOT NULL,
            west REAL NOT NULL,
            north REAL NOT NULL,
            east REAL NOT NULL,
            zoom_levels TEXT NOT NULL,
            total_tiles INTEGER NOT NULL,
            downloaded_tiles INTEGER NOT NULL DEFAULT 0,
            failed_tiles INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            size_estimate INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes for common queries
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_records_status ON records(entity_type, sync_status);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_order ON sync_queue(priority DESC, created_at ASC);
        CREATE INDEX IF NOT EXISTS idx_tiles_last_accessed ON tiles(last_accessed);
        CREATE INDEX IF NOT EXISTS idx_tiles_expires_at ON tiles(expires_at);
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Timestamps are stored as unix milliseconds so range scans order correctly.
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> Result<DateTime<Utc>, AppError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| AppError::Internal(format!("Stored timestamp {} is out of range", millis)))
}

#[cfg(test)]
pub(crate) mod test_support {
    use sqlx::SqlitePool;
    use tempfile::TempDir;

    use super::init_database;

    /// Fresh on-disk database; keep the `TempDir` alive for the test's duration.
    pub async fn test_pool() -> (SqlitePool, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let pool = init_database(&temp_dir.path().join("test.sqlite"))
            .await
            .expect("Failed to init DB");
        (pool, temp_dir)
    }
}
