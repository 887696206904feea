//! Offline area download models.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::AppError;

/// Latitude limit of the Web Mercator projection.
pub const MAX_MERCATOR_LAT: f64 = 85.051_128_78;

/// A WGS84 coordinate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Rectangular region given by two opposite corners.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bounds {
    pub south_west: Coordinate,
    pub north_east: Coordinate,
}

impl Bounds {
    /// Build bounds from any two opposite corners, normalizing their order.
    pub fn from_corners(a: Coordinate, b: Coordinate) -> Result<Self, AppError> {
        for corner in [a, b] {
            if !corner.lat.is_finite() || !corner.lon.is_finite() {
                return Err(AppError::Validation(
                    "Bounds coordinates must be finite".to_string(),
                ));
            }
            if !(-90.0..=90.0).contains(&corner.lat) || !(-180.0..=180.0).contains(&corner.lon) {
                return Err(AppError::Validation(format!(
                    "Coordinate ({}, {}) is out of range",
                    corner.lat, corner.lon
                )));
            }
        }

        Ok(Self {
            south_west: Coordinate::new(a.lat.min(b.lat), a.lon.min(b.lon)),
            north_east: Coordinate::new(a.lat.max(b.lat), a.lon.max(b.lon)),
        })
    }
}

/// Lifecycle of an area download.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    /// Every tile was attempted
    Completed,
    /// No progress was possible
    Failed,
    /// Stopped by the user before every tile was attempted
    Cancelled,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "PENDING",
            DownloadStatus::Downloading => "DOWNLOADING",
            DownloadStatus::Completed => "COMPLETED",
            DownloadStatus::Failed => "FAILED",
            DownloadStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Failed | DownloadStatus::Cancelled
        )
    }
}

impl FromStr for DownloadStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(DownloadStatus::Pending),
            "DOWNLOADING" => Ok(DownloadStatus::Downloading),
            "COMPLETED" => Ok(DownloadStatus::Completed),
            "FAILED" => Ok(DownloadStatus::Failed),
            "CANCELLED" => Ok(DownloadStatus::Cancelled),
            other => Err(AppError::Internal(format!(
                "Unknown download status '{}'",
                other
            ))),
        }
    }
}

/// A user request for offline coverage of a region.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AreaDownload {
    pub id: String,
    pub name: String,
    pub bounds: Bounds,
    pub zoom_levels: Vec<u8>,
    pub total_tiles: u64,
    /// Tiles attempted so far, successful or not
    pub downloaded_tiles: u64,
    pub failed_tiles: u64,
    pub status: DownloadStatus,
    pub size_estimate: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AreaDownload {
    pub fn percent_complete(&self) -> f64 {
        if self.total_tiles == 0 {
            return 100.0;
        }
        self.downloaded_tiles as f64 * 100.0 / self.total_tiles as f64
    }
}

/// Progress event emitted while an area download runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub download_id: String,
    pub total_tiles: u64,
    pub downloaded_tiles: u64,
    pub failed_tiles: u64,
    pub status: DownloadStatus,
}

impl DownloadProgress {
    pub fn percent(&self) -> f64 {
        if self.total_tiles == 0 {
            return 100.0;
        }
        self.downloaded_tiles as f64 * 100.0 / self.total_tiles as f64
    }
}
