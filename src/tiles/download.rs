//! Bulk download of every tile covering a region.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio::task::{JoinHandle, JoinSet};

use super::math::{ranges_for_bounds, TileRange, MAX_ZOOM};
use super::TileCacheManager;
use crate::clock::Clock;
use crate::connectivity::ConnectivityProbe;
use crate::db::TileStore;
use crate::errors::AppError;
use crate::models::{AreaDownload, Bounds, DownloadProgress, DownloadStatus, LayerType};

/// Average raster tile size used for the up-front size estimate.
pub const AVERAGE_TILE_BYTES: u64 = 15 * 1024;

/// What the user asked to make available offline.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub name: String,
    pub bounds: Bounds,
    pub zoom_levels: Vec<u8>,
    pub layer: LayerType,
}

/// Cancels a running area download. Cheap to clone and hand to the UI.
#[derive(Clone, Default)]
pub struct DownloadCancel {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl DownloadCancel {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        self.notify.notified().await;
    }
}

/// A running area download.
pub struct AreaDownloadHandle {
    pub download_id: String,
    /// Progress events; the first one is sent before any tile is fetched
    pub progress: mpsc::UnboundedReceiver<DownloadProgress>,
    cancel: DownloadCancel,
    task: JoinHandle<Result<AreaDownload, AppError>>,
}

impl AreaDownloadHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> DownloadCancel {
        self.cancel.clone()
    }

    /// Wait for the download to reach a terminal state.
    pub async fn wait(self) -> Result<AreaDownload, AppError> {
        self.task
            .await
            .map_err(|e| AppError::Internal(format!("Area download task failed: {}", e)))?
    }
}

/// Drives area downloads through the tile cache with bounded concurrency.
#[derive(Clone)]
pub struct AreaDownloadOrchestrator {
    cache: TileCacheManager,
    store: TileStore,
    connectivity: Arc<dyn ConnectivityProbe>,
    clock: Arc<dyn Clock>,
    concurrency: usize,
    max_area_tiles: u64,
}

impl AreaDownloadOrchestrator {
    pub fn new(
        cache: TileCacheManager,
        store: TileStore,
        connectivity: Arc<dyn ConnectivityProbe>,
        clock: Arc<dyn Clock>,
        concurrency: usize,
        max_area_tiles: u64,
    ) -> Self {
        Self {
            cache,
            store,
            connectivity,
            clock,
            concurrency: concurrency.max(1),
            max_area_tiles: max_area_tiles.max(1),
        }
    }

    /// Persist a new area download and start fetching its tiles in the background.
    pub async fn start(&self, request: DownloadRequest) -> Result<AreaDownloadHandle, AppError> {
        let mut zoom_levels = request.zoom_levels;
        zoom_levels.sort_unstable();
        zoom_levels.dedup();

        if zoom_levels.is_empty() {
            return Err(AppError::Validation(
                "At least one zoom level is required".to_string(),
            ));
        }
        if let Some(&zoom) = zoom_levels.iter().find(|&&z| z > MAX_ZOOM) {
            return Err(AppError::Validation(format!(
                "Zoom level {} exceeds the maximum of {}",
                zoom, MAX_ZOOM
            )));
        }

        let ranges = ranges_for_bounds(&request.bounds, &zoom_levels);
        let total_tiles: u64 = ranges.iter().map(TileRange::tile_count).sum();
        if total_tiles > self.max_area_tiles {
            return Err(AppError::Validation(format!(
                "Area covers {} tiles, more than the limit of {}",
                total_tiles, self.max_area_tiles
            )));
        }
        let layer = request.layer;
        let now = self.clock.now();

        let area = AreaDownload {
            id: uuid::Uuid::new_v4().to_string(),
            name: request.name,
            bounds: request.bounds,
            zoom_levels,
            total_tiles,
            downloaded_tiles: 0,
            failed_tiles: 0,
            status: DownloadStatus::Pending,
            size_estimate: total_tiles * AVERAGE_TILE_BYTES,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_area(&area).await?;

        tracing::info!(
            download_id = %area.id,
            name = %area.name,
            total_tiles,
            size_estimate = area.size_estimate,
            "Area download queued"
        );

        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let cancel = DownloadCancel::default();
        let download_id = area.id.clone();

        let task = tokio::spawn(self.clone().run(area, ranges, layer, progress_tx, cancel.clone()));

        Ok(AreaDownloadHandle {
            download_id,
            progress: progress_rx,
            cancel,
            task,
        })
    }

    async fn run(
        self,
        mut area: AreaDownload,
        ranges: Vec<TileRange>,
        layer: LayerType,
        progress: mpsc::UnboundedSender<DownloadProgress>,
        cancel: DownloadCancel,
    ) -> Result<AreaDownload, AppError> {
        if !self.connectivity.is_online() {
            tracing::warn!(download_id = %area.id, "Area download failed: offline");
            self.transition(&mut area, DownloadStatus::Failed, &progress)
                .await?;
            return Ok(area);
        }

        self.transition(&mut area, DownloadStatus::Downloading, &progress)
            .await?;

        let mut pending = ranges.into_iter().flat_map(move |range| range.keys(layer));
        let mut tasks = JoinSet::new();
        let mut succeeded: u64 = 0;
        let mut cancelled = false;

        loop {
            if !cancel.is_cancelled() {
                while tasks.len() < self.concurrency {
                    let Some(key) = pending.next() else { break };
                    let cache = self.cache.clone();
                    tasks.spawn(async move {
                        let result = cache.prefetch(&key).await;
                        (key, result)
                    });
                }
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { break };

                    area.downloaded_tiles += 1;
                    match joined {
                        Ok((_, Ok(_))) => succeeded += 1,
                        Ok((key, Err(e))) => {
                            area.failed_tiles += 1;
                            tracing::warn!(
                                download_id = %area.id,
                                zoom = key.zoom,
                                x = key.x,
                                y = key.y,
                                "Tile download failed: {}",
                                e
                            );
                        }
                        Err(e) => {
                            area.failed_tiles += 1;
                            tracing::warn!(download_id = %area.id, "Tile task failed: {}", e);
                        }
                    }

                    self.record_progress(&mut area, &progress).await?;
                }
                _ = cancel.cancelled() => {
                    cancelled = true;
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }

        let cancelled =
            cancelled || (cancel.is_cancelled() && area.downloaded_tiles < area.total_tiles);

        let status = if cancelled {
            DownloadStatus::Cancelled
        } else if area.total_tiles > 0 && succeeded == 0 {
            DownloadStatus::Failed
        } else {
            DownloadStatus::Completed
        };
        self.transition(&mut area, status, &progress).await?;

        tracing::info!(
            download_id = %area.id,
            status = status.as_str(),
            downloaded_tiles = area.downloaded_tiles,
            failed_tiles = area.failed_tiles,
            total_tiles = area.total_tiles,
            "Area download finished"
        );

        Ok(area)
    }

    async fn transition(
        &self,
        area: &mut AreaDownload,
        status: DownloadStatus,
        progress: &mpsc::UnboundedSender<DownloadProgress>,
    ) -> Result<(), AppError> {
        area.status = status;
        self.record_progress(area, progress).await
    }

    async fn record_progress(
        &self,
        area: &mut AreaDownload,
        progress: &mpsc::UnboundedSender<DownloadProgress>,
    ) -> Result<(), AppError> {
        area.updated_at = self.clock.now();
        self.store
            .update_area_progress(
                &area.id,
                area.downloaded_tiles,
                area.failed_tiles,
                area.status,
                area.updated_at,
            )
            .await?;

        // Nobody listening is fine.
        let _ = progress.send(DownloadProgress {
            download_id: area.id.clone(),
            total_tiles: area.total_tiles,
            downloaded_tiles: area.downloaded_tiles,
            failed_tiles: area.failed_tiles,
            status: area.status,
        });
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<AreaDownload>, AppError> {
        self.store.list_areas().await
    }

    pub async fn get(&self, id: &str) -> Result<Option<AreaDownload>, AppError> {
        self.store.get_area(id).await
    }

    /// Forget a finished area download. Cached tiles stay until evicted.
    pub async fn delete(&self, id: &str) -> Result<(), AppError> {
        let area = self
            .store
            .get_area(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Area download {} not found", id)))?;

        if !area.status.is_terminal() {
            return Err(AppError::Validation(format!(
                "Area download {} is still {}; cancel it first",
                id,
                area.status.as_str()
            )));
        }

        self.store.delete_area(id).await
    }
}
