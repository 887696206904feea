//! Map tile cache.
//!
//! [`TileCacheManager`] is a read-through cache over a [`TileSource`]: fresh tiles are
//! served from SQLite, missing or expired ones are fetched and stored, and a stale
//! copy beats no tile when the fetch fails. Size is kept under budget by a
//! maintenance pass that runs in the background every few writes.

mod download;
pub mod math;
mod source;

pub use download::{
    AreaDownloadHandle, AreaDownloadOrchestrator, DownloadCancel, DownloadRequest,
    AVERAGE_TILE_BYTES,
};
pub use source::{HttpTileSource, TileSource};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::db::{Removed, TileStore};
use crate::errors::AppError;
use crate::models::{CacheStats, MaintenanceReport, TileKey};

/// Knobs for expiry and eviction.
#[derive(Debug, Clone, Copy)]
pub struct TileCacheSettings {
    pub ttl: Duration,
    pub budget_bytes: u64,
    pub maintenance_every_writes: u64,
}

struct Inner {
    store: TileStore,
    source: Arc<dyn TileSource>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
    budget_bytes: u64,
    maintenance_every_writes: u64,
    writes_since_maintenance: AtomicU64,
    maintenance_running: AtomicBool,
}

struct MaintenanceGuard<'a>(&'a AtomicBool);

impl Drop for MaintenanceGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Read-through tile cache with LRU eviction under a byte budget.
#[derive(Clone)]
pub struct TileCacheManager {
    inner: Arc<Inner>,
}

impl TileCacheManager {
    pub fn new(
        store: TileStore,
        source: Arc<dyn TileSource>,
        clock: Arc<dyn Clock>,
        settings: TileCacheSettings,
    ) -> Self {
        let ttl = chrono::Duration::from_std(settings.ttl)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));

        Self {
            inner: Arc::new(Inner {
                store,
                source,
                clock,
                ttl,
                budget_bytes: settings.budget_bytes,
                maintenance_every_writes: settings.maintenance_every_writes.max(1),
                writes_since_maintenance: AtomicU64::new(0),
                maintenance_running: AtomicBool::new(false),
            }),
        }
    }

    /// Tile bytes for display, or `None` when neither the cache nor the network has it.
    ///
    /// Never fails: storage and network errors are logged and degrade to a stale
    /// copy or `None`.
    pub async fn get_tile(&self, key: &TileKey) -> Option<Vec<u8>> {
        let now = self.inner.clock.now();

        let cached = match self.inner.store.get(key).await {
            Ok(cached) => cached,
            Err(e) => {
                tracing::warn!(tile = %key, "Tile cache read failed: {}", e);
                None
            }
        };

        let stale = match cached {
            Some(entry) if !entry.is_expired(now) => {
                if let Err(e) = self.inner.store.touch(key, now).await {
                    tracing::warn!(tile = %key, "Failed to record tile access: {}", e);
                }
                tracing::debug!(tile = %key, "Tile cache hit");
                return Some(entry.tile_data);
            }
            Some(entry) => Some(entry.tile_data),
            None => None,
        };

        match self.inner.source.fetch_tile(key).await {
            Ok(bytes) => {
                if let Err(e) = self.store_tile(key, &bytes).await {
                    tracing::warn!(tile = %key, "Failed to cache fetched tile: {}", e);
                }
                Some(bytes)
            }
            Err(e) => {
                tracing::warn!(
                    zoom = key.zoom,
                    x = key.x,
                    y = key.y,
                    stale = stale.is_some(),
                    "Tile fetch failed: {}",
                    e
                );
                stale
            }
        }
    }

    /// Make sure a fresh copy of the tile is cached. Returns the stored size.
    ///
    /// This is the fetch path used by area downloads; unlike [`get_tile`](Self::get_tile)
    /// it reports failures.
    pub async fn prefetch(&self, key: &TileKey) -> Result<u64, AppError> {
        let now = self.inner.clock.now();
        if let Some(entry) = self.inner.store.get(key).await? {
            if !entry.is_expired(now) {
                return Ok(entry.size_bytes);
            }
        }

        let bytes = self.inner.source.fetch_tile(key).await?;
        self.store_tile(key, &bytes).await?;
        Ok(bytes.len() as u64)
    }

    async fn store_tile(&self, key: &TileKey, bytes: &[u8]) -> Result<(), AppError> {
        let now = self.inner.clock.now();
        self.inner
            .store
            .put(key, bytes, now, now + self.inner.ttl)
            .await?;
        self.note_write();
        Ok(())
    }

    fn note_write(&self) {
        let writes = self
            .inner
            .writes_since_maintenance
            .fetch_add(1, Ordering::SeqCst)
            + 1;
        if writes < self.inner.maintenance_every_writes {
            return;
        }
        self.inner.writes_since_maintenance.store(0, Ordering::SeqCst);

        let cache = self.clone();
        tokio::spawn(async move {
            if let Err(e) = cache.maintain().await {
                tracing::warn!("Background cache maintenance failed: {}", e);
            }
        });
    }

    /// Purge expired tiles, then evict least-recently-accessed tiles until the cache
    /// fits its budget.
    ///
    /// Returns `None` when another maintenance pass is already running.
    pub async fn maintain(&self) -> Result<Option<MaintenanceReport>, AppError> {
        if self
            .inner
            .maintenance_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Cache maintenance already running");
            return Ok(None);
        }
        let _guard = MaintenanceGuard(&self.inner.maintenance_running);

        let now = self.inner.clock.now();
        let expired = self.inner.store.delete_expired(now).await?;
        let evicted = self.inner.store.evict_to_budget(self.inner.budget_bytes).await?;
        let total_bytes_after = self.inner.store.total_bytes().await?;

        let report = MaintenanceReport {
            expired_removed: expired.tiles,
            evicted: evicted.tiles,
            bytes_freed: expired.bytes + evicted.bytes,
            total_bytes_after,
        };

        if report.expired_removed > 0 || report.evicted > 0 {
            tracing::info!(
                expired_removed = report.expired_removed,
                evicted = report.evicted,
                bytes_freed = report.bytes_freed,
                total_bytes_after,
                "Tile cache maintenance finished"
            );
        } else {
            tracing::debug!(total_bytes_after, "Tile cache maintenance found nothing to do");
        }

        Ok(Some(report))
    }

    pub async fn stats(&self) -> Result<CacheStats, AppError> {
        self.inner
            .store
            .stats(self.inner.clock.now(), self.inner.budget_bytes)
            .await
    }

    /// Drop every cached tile. Area download records are kept.
    pub async fn clear(&self) -> Result<Removed, AppError> {
        let removed = self.inner.store.clear().await?;
        self.inner.writes_since_maintenance.store(0, Ordering::SeqCst);
        tracing::info!(
            tiles = removed.tiles,
            bytes = removed.bytes,
            "Tile cache cleared"
        );
        Ok(removed)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    /// Tile source that serves `size` bytes derived from the key and counts calls.
    pub struct CountingSource {
        pub calls: AtomicUsize,
        pub size: usize,
        pub failing: Mutex<HashSet<TileKey>>,
        pub fail_all: AtomicBool,
        pub delay: Option<Duration>,
    }

    impl CountingSource {
        pub fn new(size: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                size,
                failing: Mutex::new(HashSet::new()),
                fail_all: AtomicBool::new(false),
                delay: None,
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn fail(&self, key: TileKey) {
            self.failing.lock().unwrap().insert(key);
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn body_for(&self, key: &TileKey) -> Vec<u8> {
            vec![(key.x % 251) as u8; self.size]
        }
    }

    #[async_trait]
    impl TileSource for CountingSource {
        async fn fetch_tile(&self, key: &TileKey) -> Result<Vec<u8>, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_all.load(Ordering::SeqCst) || self.failing.lock().unwrap().contains(key)
            {
                return Err(AppError::Network(format!("tile {} unreachable", key)));
            }
            Ok(self.body_for(key))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::CountingSource;
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::test_support::test_pool;
    use crate::models::LayerType;
    use chrono::DateTime;
    use tempfile::TempDir;

    struct Harness {
        cache: TileCacheManager,
        source: Arc<CountingSource>,
        clock: Arc<ManualClock>,
        _temp_dir: TempDir,
    }

    async fn harness(size: usize, settings: TileCacheSettings) -> Harness {
        let (pool, temp_dir) = test_pool().await;
        let source = Arc::new(CountingSource::new(size));
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        ));
        let cache = TileCacheManager::new(
            TileStore::new(pool),
            source.clone(),
            clock.clone(),
            settings,
        );
        Harness {
            cache,
            source,
            clock,
            _temp_dir: temp_dir,
        }
    }

    fn settings(budget_bytes: u64) -> TileCacheSettings {
        TileCacheSettings {
            ttl: Duration::from_secs(3600),
            budget_bytes,
            maintenance_every_writes: 1_000,
        }
    }

    fn key(x: u32) -> TileKey {
        TileKey::new(15, x, 17_000, LayerType::Street)
    }

    #[tokio::test]
    async fn test_reads_before_expiry_hit_the_cache() {
        let h = harness(64, settings(1 << 20)).await;

        let first = h.cache.get_tile(&key(1)).await.unwrap();
        h.clock.advance(chrono::Duration::minutes(30));
        let second = h.cache.get_tile(&key(1)).await.unwrap();

        assert_eq!(first, h.source.body_for(&key(1)));
        assert_eq!(first, second);
        assert_eq!(h.source.call_count(), 1);
    }

    #[tokio::test]
    async fn test_expired_tile_is_refetched() {
        let h = harness(64, settings(1 << 20)).await;

        h.cache.get_tile(&key(1)).await.unwrap();
        h.clock.advance(chrono::Duration::hours(2));
        h.cache.get_tile(&key(1)).await.unwrap();

        assert_eq!(h.source.call_count(), 2);
    }

    #[tokio::test]
    async fn test_stale_tile_served_when_fetch_fails() {
        let h = harness(64, settings(1 << 20)).await;

        let fresh = h.cache.get_tile(&key(2)).await.unwrap();
        h.clock.advance(chrono::Duration::hours(2));
        h.source.fail_all.store(true, Ordering::SeqCst);

        let stale = h.cache.get_tile(&key(2)).await;
        let missing = h.cache.get_tile(&key(3)).await;

        assert_eq!(stale, Some(fresh));
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn test_maintenance_keeps_most_recently_accessed_tiles() {
        let h = harness(100, settings(250)).await;

        for x in 0..5 {
            h.cache.get_tile(&key(x)).await.unwrap();
            h.clock.advance(chrono::Duration::seconds(1));
        }
        // Reading tile 1 again makes it the most recent.
        h.cache.get_tile(&key(1)).await.unwrap();

        let report = h.cache.maintain().await.unwrap().unwrap();

        assert_eq!(report.evicted, 3);
        assert_eq!(report.bytes_freed, 300);
        assert!(report.total_bytes_after <= 250);

        let calls_before = h.source.call_count();
        h.cache.get_tile(&key(1)).await.unwrap();
        h.cache.get_tile(&key(4)).await.unwrap();
        assert_eq!(h.source.call_count(), calls_before);
    }

    #[tokio::test]
    async fn test_maintenance_purges_expired_tiles_under_budget() {
        let h = harness(10, settings(1 << 20)).await;

        h.cache.get_tile(&key(1)).await.unwrap();
        h.clock.advance(chrono::Duration::hours(2));
        h.cache.get_tile(&key(2)).await.unwrap();

        let report = h.cache.maintain().await.unwrap().unwrap();

        assert_eq!(report.expired_removed, 1);
        assert_eq!(report.evicted, 0);
        let stats = h.cache.stats().await.unwrap();
        assert_eq!(stats.tile_count, 1);
        assert_eq!(stats.total_bytes, 10);
        assert_eq!(stats.expired_count, 0);
    }

    #[tokio::test]
    async fn test_writes_trigger_background_maintenance() {
        let h = harness(
            100,
            TileCacheSettings {
                ttl: Duration::from_secs(3600),
                budget_bytes: 150,
                maintenance_every_writes: 3,
            },
        )
        .await;

        for x in 0..3 {
            h.cache.get_tile(&key(x)).await.unwrap();
            h.clock.advance(chrono::Duration::seconds(1));
        }

        let mut total = u64::MAX;
        for _ in 0..50 {
            total = h.cache.stats().await.unwrap().total_bytes;
            if total <= 150 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(total, 100);
    }

    #[tokio::test]
    async fn test_clear_empties_the_cache() {
        let h = harness(32, settings(1 << 20)).await;
        h.cache.get_tile(&key(1)).await.unwrap();
        h.cache.get_tile(&key(2)).await.unwrap();

        let removed = h.cache.clear().await.unwrap();

        assert_eq!(removed, Removed { tiles: 2, bytes: 64 });
        assert_eq!(h.cache.stats().await.unwrap().tile_count, 0);
    }

    #[tokio::test]
    async fn test_prefetch_skips_fresh_tiles_and_reports_failures() {
        let h = harness(48, settings(1 << 20)).await;

        assert_eq!(h.cache.prefetch(&key(7)).await.unwrap(), 48);
        assert_eq!(h.cache.prefetch(&key(7)).await.unwrap(), 48);
        assert_eq!(h.source.call_count(), 1);

        h.source.fail(key(8));
        assert!(matches!(
            h.cache.prefetch(&key(8)).await,
            Err(AppError::Network(_))
        ));
    }
}
