//! Tile and area download storage.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use super::{from_millis, to_millis};
use crate::errors::AppError;
use crate::models::{
    AreaDownload, Bounds, CacheStats, Coordinate, DownloadStatus, TileEntry, TileKey,
};

/// Rows fetched per eviction round.
const EVICTION_BATCH: i64 = 128;

/// Outcome of a delete pass over the tile table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Removed {
    pub tiles: u64,
    pub bytes: u64,
}

/// Durable storage for cached tiles and area downloads.
#[derive(Clone)]
pub struct TileStore {
    pool: SqlitePool,
}

impl TileStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ==================== TILE OPERATIONS ====================

    /// Get a tile by key, expired or not.
    pub async fn get(&self, key: &TileKey) -> Result<Option<TileEntry>, AppError> {
        let row = sqlx::query(
            "SELECT zoom, x, y, layer, tile_data, size_bytes, last_accessed, expires_at FROM tiles WHERE zoom = ? AND x = ? AND y = ? AND layer = ?"
        )
        .bind(key.zoom as i64)
        .bind(key.x as i64)
        .bind(key.y as i64)
        .bind(key.layer.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(tile_from_row).transpose()
    }

    /// Record a read of the tile.
    pub async fn touch(&self, key: &TileKey, now: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE tiles SET last_accessed = ? WHERE zoom = ? AND x = ? AND y = ? AND layer = ?",
        )
        .bind(to_millis(now))
        .bind(key.zoom as i64)
        .bind(key.x as i64)
        .bind(key.y as i64)
        .bind(key.layer.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Store or overwrite a tile. Last writer wins.
    pub async fn put(
        &self,
        key: &TileKey,
        tile_data: &[u8],
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"INSERT INTO tiles (zoom, x, y, layer, tile_data, size_bytes, last_accessed, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (zoom, x, y, layer) DO UPDATE SET
                tile_data = excluded.tile_data,
                size_bytes = excluded.size_bytes,
                last_accessed = excluded.last_accessed,
                expires_at = excluded.expires_at"#,
        )
        .bind(key.zoom as i64)
        .bind(key.x as i64)
        .bind(key.y as i64)
        .bind(key.layer.as_str())
        .bind(tile_data)
        .bind(tile_data.len() as i64)
        .bind(to_millis(now))
        .bind(to_millis(expires_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Sum of the stored tile sizes.
    pub async fn total_bytes(&self) -> Result<u64, AppError> {
        let total: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(size_bytes), 0) FROM tiles")
            .fetch_one(&self.pool)
            .await?;
        Ok(total as u64)
    }

    pub async fn stats(&self, now: DateTime<Utc>, budget_bytes: u64) -> Result<CacheStats, AppError> {
        let row = sqlx::query(
            r#"SELECT
                COUNT(*) AS tile_count,
                COALESCE(SUM(size_bytes), 0) AS total_bytes,
                COALESCE(SUM(CASE WHEN expires_at <= ? THEN 1 ELSE 0 END), 0) AS expired_count,
                MIN(last_accessed) AS oldest_access,
                MAX(last_accessed) AS newest_access
            FROM tiles"#,
        )
        .bind(to_millis(now))
        .fetch_one(&self.pool)
        .await?;

        let tile_count: i64 = row.get("tile_count");
        let total_bytes: i64 = row.get("total_bytes");
        let expired_count: i64 = row.get("expired_count");
        let oldest_access: Option<i64> = row.get("oldest_access");
        let newest_access: Option<i64> = row.get("newest_access");

        Ok(CacheStats {
            tile_count: tile_count as u64,
            total_bytes: total_bytes as u64,
            expired_count: expired_count as u64,
            budget_bytes,
            oldest_access: oldest_access.map(from_millis).transpose()?,
            newest_access: newest_access.map(from_millis).transpose()?,
        })
    }

    /// Delete every tile whose expiry has passed.
    pub async fn delete_expired(&self, now: DateTime<Utc>) -> Result<Removed, AppError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT COUNT(*) AS tiles, COALESCE(SUM(size_bytes), 0) AS bytes FROM tiles WHERE expires_at <= ?",
        )
        .bind(to_millis(now))
        .fetch_one(&mut *tx)
        .await?;
        let tiles: i64 = row.get("tiles");
        let bytes: i64 = row.get("bytes");

        if tiles > 0 {
            sqlx::query("DELETE FROM tiles WHERE expires_at <= ?")
                .bind(to_millis(now))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(Removed {
            tiles: tiles as u64,
            bytes: bytes as u64,
        })
    }

    /// Delete least-recently-accessed tiles until the stored total fits `budget_bytes`.
    pub async fn evict_to_budget(&self, budget_bytes: u64) -> Result<Removed, AppError> {
        let mut tx = self.pool.begin().await?;

        let total: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(size_bytes), 0) FROM tiles")
            .fetch_one(&mut *tx)
            .await?;
        let mut remaining = total as u64;
        let mut removed = Removed::default();

        while remaining > budget_bytes {
            let rows = sqlx::query(
                "SELECT rowid AS tile_rowid, size_bytes FROM tiles ORDER BY last_accessed ASC, rowid ASC LIMIT ?",
            )
            .bind(EVICTION_BATCH)
            .fetch_all(&mut *tx)
            .await?;

            if rows.is_empty() {
                break;
            }

            for row in rows {
                let rowid: i64 = row.get("tile_rowid");
                let size: i64 = row.get("size_bytes");

                sqlx::query("DELETE FROM tiles WHERE rowid = ?")
                    .bind(rowid)
                    .execute(&mut *tx)
                    .await?;

                removed.tiles += 1;
                removed.bytes += size as u64;
                remaining = remaining.saturating_sub(size as u64);
                if remaining <= budget_bytes {
                    break;
                }
            }
        }

        tx.commit().await?;
        Ok(removed)
    }

    /// Delete every cached tile.
    pub async fn clear(&self) -> Result<Removed, AppError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT COUNT(*) AS tiles, COALESCE(SUM(size_bytes), 0) AS bytes FROM tiles",
        )
        .fetch_one(&mut *tx)
        .await?;
        let tiles: i64 = row.get("tiles");
        let bytes: i64 = row.get("bytes");

        sqlx::query("DELETE FROM tiles").execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(Removed {
            tiles: tiles as u64,
            bytes: bytes as u64,
        })
    }

    // ==================== AREA DOWNLOAD OPERATIONS ====================

    pub async fn insert_area(&self, area: &AreaDownload) -> Result<(), AppError> {
        let zoom_levels = serde_json::to_string(&area.zoom_levels)?;

        sqlx::query(
            "INSERT INTO area_downloads (id, name, south, west, north, east, zoom_levels, total_tiles, downloaded_tiles, failed_tiles, status, size_estimate, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        )
        .bind(&area.id)
        .bind(&area.name)
        .bind(area.bounds.south_west.lat)
        .bind(area.bounds.south_west.lon)
        .bind(area.bounds.north_east.lat)
        .bind(area.bounds.north_east.lon)
        .bind(&zoom_levels)
        .bind(area.total_tiles as i64)
        .bind(area.downloaded_tiles as i64)
        .bind(area.failed_tiles as i64)
        .bind(area.status.as_str())
        .bind(area.size_estimate as i64)
        .bind(to_millis(area.created_at))
        .bind(to_millis(area.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_area(&self, id: &str) -> Result<Option<AreaDownload>, AppError> {
        let row = sqlx::query(
            "SELECT id, name, south, west, north, east, zoom_levels, total_tiles, downloaded_tiles, failed_tiles, status, size_estimate, created_at, updated_at FROM area_downloads WHERE id = ?"
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(area_from_row).transpose()
    }

    /// List all area downloads, newest first.
    pub async fn list_areas(&self) -> Result<Vec<AreaDownload>, AppError> {
        let rows = sqlx::query(
            "SELECT id, name, south, west, north, east, zoom_levels, total_tiles, downloaded_tiles, failed_tiles, status, size_estimate, created_at, updated_at FROM area_downloads ORDER BY created_at DESC"
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(area_from_row).collect()
    }

    pub async fn update_area_progress(
        &self,
        id: &str,
        downloaded_tiles: u64,
        failed_tiles: u64,
        status: DownloadStatus,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE area_downloads SET downloaded_tiles = ?, failed_tiles = ?, status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(downloaded_tiles as i64)
        .bind(failed_tiles as i64)
        .bind(status.as_str())
        .bind(to_millis(now))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Area download {} not found", id)));
        }
        Ok(())
    }

    pub async fn delete_area(&self, id: &str) -> Result<(), AppError> {
        let result = sqlx::query("DELETE FROM area_downloads WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Area download {} not found", id)));
        }
        Ok(())
    }
}

// Helper functions for row conversion

fn tile_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TileEntry, AppError> {
    let zoom: i64 = row.get("zoom");
    let x: i64 = row.get("x");
    let y: i64 = row.get("y");
    let layer: String = row.get("layer");
    let size_bytes: i64 = row.get("size_bytes");

    Ok(TileEntry {
        key: TileKey::new(zoom as u8, x as u32, y as u32, layer.parse()?),
        tile_data: row.get("tile_data"),
        size_bytes: size_bytes as u64,
        last_accessed: from_millis(row.get("last_accessed"))?,
        expires_at: from_millis(row.get("expires_at"))?,
    })
}

fn area_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<AreaDownload, AppError> {
    let zoom_levels: String = row.get("zoom_levels");
    let status: String = row.get("status");
    let total_tiles: i64 = row.get("total_tiles");
    let downloaded_tiles: i64 = row.get("downloaded_tiles");
    let failed_tiles: i64 = row.get("failed_tiles");
    let size_estimate: i64 = row.get("size_estimate");

    Ok(AreaDownload {
        id: row.get("id"),
        name: row.get("name"),
        bounds: Bounds {
            south_west: Coordinate::new(row.get("south"), row.get("west")),
            north_east: Coordinate::new(row.get("north"), row.get("east")),
        },
        zoom_levels: serde_json::from_str(&zoom_levels)?,
        total_tiles: total_tiles as u64,
        downloaded_tiles: downloaded_tiles as u64,
        failed_tiles: failed_tiles as u64,
        status: status.parse()?,
        size_estimate: size_estimate as u64,
        created_at: from_millis(row.get("created_at"))?,
        updated_at: from_millis(row.get("updated_at"))?,
    })
}
