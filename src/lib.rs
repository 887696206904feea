//! Field Sync Core
//!
//! Offline-first data layer for sanitation field work: a durable mutation queue
//! replayed against the backend when connectivity returns, and a map tile cache
//! with offline area downloads, both persisted in SQLite.
//!
//! [`FieldSync`] wires the pieces together. Every collaborator is passed in
//! explicitly; nothing here is a global.

pub mod clock;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod errors;
pub mod gateway;
pub mod models;
pub mod sync;
pub mod telemetry;
pub mod tiles;


use std::sync::Arc;

use clock::{Clock, SystemClock};
use config::Config;
use connectivity::{ConnectivityProbe, SharedConnectivity};
use db::{RecordStore, Removed, SyncQueue, TileStore};
use errors::AppError;
use gateway::{HttpGateway, RemoteGateway};
use models::{
    AreaDownload, CacheStats, EntityType, MaintenanceReport, Mutation, Record, SyncQueueEntry,
    SyncState, SyncStatus, SyncSummary, TileKey,
};
use sync::{RetryPolicy, SyncEngine, SyncWorker};
use tiles::{
    AreaDownloadHandle, AreaDownloadOrchestrator, DownloadRequest, HttpTileSource,
    TileCacheManager, TileCacheSettings, TileSource,
};

/// External services the core talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub gateway: Arc<dyn RemoteGateway>,
    pub tile_source: Arc<dyn TileSource>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// HTTP gateway and tile source configured from `config`.
    pub fn http(config: &Config) -> Result<Self, AppError> {
        let gateway = HttpGateway::new(
            config.api_base_url.clone(),
            config.api_token.clone(),
            config.http_timeout,
        )?;
        let tile_source =
            HttpTileSource::new(config.tile_url_template.clone(), config.http_timeout)?;

        Ok(Self {
            gateway: Arc::new(gateway),
            tile_source: Arc::new(tile_source),
            clock: Arc::new(SystemClock),
        })
    }
}

/// Entry point for host applications.
pub struct FieldSync {
    records: RecordStore,
    queue: SyncQueue,
    engine: Arc<SyncEngine>,
    connectivity: SharedConnectivity,
    tiles: TileCacheManager,
    downloads: AreaDownloadOrchestrator,
    worker: Option<SyncWorker>,
    config: Config,
}

impl FieldSync {
    /// Open the database at `config.db_path` and talk to the configured backend over HTTP.
    pub async fn open(config: Config) -> Result<Self, AppError> {
        let collaborators = Collaborators::http(&config)?;
        Self::with_collaborators(config, collaborators).await
    }

    pub async fn with_collaborators(
        config: Config,
        collaborators: Collaborators,
    ) -> Result<Self, AppError> {
        tracing::info!("Opening field sync database at {:?}", config.db_path);
        let pool = db::init_database(&config.db_path).await?;

        let clock = collaborators.clock;
        let connectivity = SharedConnectivity::default();
        let probe: Arc<dyn ConnectivityProbe> = Arc::new(connectivity.clone());

        let records = RecordStore::new(pool.clone(), clock.clone(), config.max_retries);
        let queue = SyncQueue::new(pool.clone(), clock.clone(), config.max_retries);

        let engine = Arc::new(SyncEngine::new(
            records.clone(),
            queue.clone(),
            collaborators.gateway,
            probe.clone(),
            clock.clone(),
            RetryPolicy {
                fast_fail_permanent: config.fast_fail_permanent,
                replay_timeout: config.http_timeout * 2,
            },
        ));

        let tile_store = TileStore::new(pool);
        let tiles = TileCacheManager::new(
            tile_store.clone(),
            collaborators.tile_source,
            clock.clone(),
            TileCacheSettings {
                ttl: config.tile_ttl,
                budget_bytes: config.cache_budget_bytes,
                maintenance_every_writes: config.maintenance_every_writes,
            },
        );
        let downloads = AreaDownloadOrchestrator::new(
            tiles.clone(),
            tile_store,
            probe,
            clock,
            config.download_concurrency,
            config.max_area_tiles,
        );

        Ok(Self {
            records,
            queue,
            engine,
            connectivity,
            tiles,
            downloads,
            worker: None,
            config,
        })
    }

    // ==================== CONNECTIVITY & WORKER ====================

    /// Start the background sync worker. Later calls are no-ops.
    pub fn start_background_sync(&mut self) {
        if self.worker.is_some() {
            return;
        }
        let worker = SyncWorker::spawn(
            self.engine.clone(),
            self.config.sync_backoff_base,
            self.config.sync_backoff_max,
        );
        worker.trigger();
        self.worker = Some(worker);
    }

    /// Feed a reachability change from the platform. Regaining connectivity triggers a sync.
    pub fn set_online(&self, online: bool) {
        if self.connectivity.set_online(online) {
            self.request_sync();
        }
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Ask the background worker for a sync cycle (foreground, manual refresh).
    pub fn request_sync(&self) {
        if let Some(worker) = &self.worker {
            worker.trigger();
        }
    }

    /// Stop the background worker, letting a running cycle finish.
    pub async fn shutdown(mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown().await;
        }
    }

    // ==================== RECORDS & QUEUE ====================

    /// Record a local mutation and queue it for the backend.
    pub async fn enqueue(&self, mutation: Mutation) -> Result<Record, AppError> {
        let record = self.records.apply_mutation(&mutation).await?;
        if self.is_online() {
            self.request_sync();
        }
        Ok(record)
    }

    pub async fn save_draft(
        &self,
        entity_type: EntityType,
        payload: serde_json::Value,
    ) -> Result<Record, AppError> {
        self.records.save_draft(entity_type, payload).await
    }

    pub async fn update_draft(
        &self,
        id: &str,
        payload: serde_json::Value,
    ) -> Result<Record, AppError> {
        self.records.update_draft(id, payload).await
    }

    pub async fn get_record(&self, id: &str) -> Result<Option<Record>, AppError> {
        self.records.get(id).await
    }

    pub async fn list_records(
        &self,
        entity_type: Option<EntityType>,
        statuses: &[SyncStatus],
    ) -> Result<Vec<Record>, AppError> {
        self.records.list_by_status(entity_type, statuses).await
    }

    /// Give a permanently failed entry another full set of attempts.
    pub async fn retry_entry(&self, entry_id: &str) -> Result<SyncQueueEntry, AppError> {
        let entry = self.queue.retry(entry_id).await?;
        self.request_sync();
        Ok(entry)
    }

    /// Give up on syncing an entry; its record becomes a local draft again.
    pub async fn discard_entry(&self, entry_id: &str) -> Result<(), AppError> {
        self.queue.discard(entry_id).await
    }

    // ==================== SYNC ====================

    pub async fn run_sync_cycle(&self) -> Result<SyncSummary, AppError> {
        self.engine.run_sync_cycle().await
    }

    pub fn cancel_sync(&self) {
        self.engine.cancel();
    }

    pub async fn sync_state(&self) -> Result<SyncState, AppError> {
        self.engine.sync_state().await
    }

    // ==================== TILES ====================

    pub async fn get_tile(&self, key: &TileKey) -> Option<Vec<u8>> {
        self.tiles.get_tile(key).await
    }

    pub async fn download_area(
        &self,
        request: DownloadRequest,
    ) -> Result<AreaDownloadHandle, AppError> {
        self.downloads.start(request).await
    }

    pub async fn list_area_downloads(&self) -> Result<Vec<AreaDownload>, AppError> {
        self.downloads.list().await
    }

    pub async fn delete_area_download(&self, id: &str) -> Result<(), AppError> {
        self.downloads.delete(id).await
    }

    pub async fn clear_cache(&self) -> Result<Removed, AppError> {
        self.tiles.clear().await
    }

    pub async fn get_cache_stats(&self) -> Result<CacheStats, AppError> {
        self.tiles.stats().await
    }

    pub async fn run_cache_maintenance(&self) -> Result<Option<MaintenanceReport>, AppError> {
        self.tiles.maintain().await
    }
}
