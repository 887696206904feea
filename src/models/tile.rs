//! Map tile cache models.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::AppError;

/// Imagery layer a tile belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LayerType {
    Street,
    Satellite,
    Terrain,
}

impl LayerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerType::Street => "street",
            LayerType::Satellite => "satellite",
            LayerType::Terrain => "terrain",
        }
    }
}

impl FromStr for LayerType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "street" => Ok(LayerType::Street),
            "satellite" => Ok(LayerType::Satellite),
            "terrain" => Ok(LayerType::Terrain),
            other => Err(AppError::Validation(format!("Unknown layer type '{}'", other))),
        }
    }
}

/// Composite key of a cached tile.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct TileKey {
    pub zoom: u8,
    pub x: u32,
    pub y: u32,
    pub layer: LayerType,
}

impl TileKey {
    pub fn new(zoom: u8, x: u32, y: u32, layer: LayerType) -> Self {
        Self { zoom, x, y, layer }
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.layer.as_str(), self.zoom, self.x, self.y)
    }
}

/// A stored tile with its access and expiry bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct TileEntry {
    pub key: TileKey,
    pub tile_data: Vec<u8>,
    pub size_bytes: u64,
    pub last_accessed: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TileEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Aggregate numbers about the tile cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub tile_count: u64,
    pub total_bytes: u64,
    pub expired_count: u64,
    pub budget_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_access: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_access: Option<DateTime<Utc>>,
}

/// Result of one cache maintenance pass.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    pub expired_removed: u64,
    pub evicted: u64,
    pub bytes_freed: u64,
    pub total_bytes_after: u64,
}
