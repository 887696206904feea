//! Sync engine: replays queued mutations against the remote gateway.
//!
//! Entries are replayed one at a time in drain order. A failing entry is booked
//! and the batch moves on. Only one cycle runs at a time; a trigger that arrives
//! while a cycle is running is folded into one extra pass of that cycle.

mod worker;

pub use worker::{backoff_delay, SyncWorker};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::connectivity::ConnectivityProbe;
use crate::db::{RecordStore, SyncQueue};
use crate::errors::{AppError, ErrorDetails};
use crate::gateway::{self, GatewayRequest, RemoteGateway};
use crate::models::{Operation, SkipReason, SyncQueueEntry, SyncState, SyncSummary};

/// How failures are charged against an entry's retry budget.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Park entries right away when the backend reports a permanent (4xx) error
    pub fast_fail_permanent: bool,
    /// Upper bound for a single gateway call
    pub replay_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            fast_fail_permanent: false,
            replay_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
struct CycleStatus {
    last_sync_at: Option<DateTime<Utc>>,
    last_error: Option<ErrorDetails>,
}

/// Clears the running flag however the cycle ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncEngine {
    records: RecordStore,
    queue: SyncQueue,
    gateway: Arc<dyn RemoteGateway>,
    connectivity: Arc<dyn ConnectivityProbe>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    running: AtomicBool,
    rerun_requested: AtomicBool,
    cancel_requested: AtomicBool,
    status: Mutex<CycleStatus>,
}

impl SyncEngine {
    pub fn new(
        records: RecordStore,
        queue: SyncQueue,
        gateway: Arc<dyn RemoteGateway>,
        connectivity: Arc<dyn ConnectivityProbe>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            records,
            queue,
            gateway,
            connectivity,
            clock,
            policy,
            running: AtomicBool::new(false),
            rerun_requested: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            status: Mutex::new(CycleStatus::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the running cycle before its next entry. The entry in flight finishes.
    pub fn cancel(&self) {
        if self.is_running() {
            tracing::info!("Sync cycle cancellation requested");
            self.cancel_requested.store(true, Ordering::SeqCst);
        }
    }

    /// Run one sync cycle.
    ///
    /// Returns immediately when offline or when another cycle is already running.
    /// Expected failures (network down, backend rejections) are booked per entry;
    /// only storage errors and corrupt queue rows are returned as `Err`.
    pub async fn run_sync_cycle(&self) -> Result<SyncSummary, AppError> {
        if !self.connectivity.is_online() {
            tracing::debug!("Skipping sync cycle: offline");
            return Ok(SyncSummary::skipped(SkipReason::Offline));
        }

        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.rerun_requested.store(true, Ordering::SeqCst);
            tracing::debug!("Sync cycle already running; scheduled a follow-up pass");
            return Ok(SyncSummary::skipped(SkipReason::AlreadyRunning));
        }
        let _guard = RunningGuard(&self.running);
        self.cancel_requested.store(false, Ordering::SeqCst);

        let mut total = SyncSummary::default();
        loop {
            self.rerun_requested.store(false, Ordering::SeqCst);

            let pass = self.run_pass().await?;
            total.absorb(&pass);

            let rerun = self.rerun_requested.load(Ordering::SeqCst);
            if pass.cancelled || !rerun || !self.connectivity.is_online() {
                break;
            }
        }

        self.finish_cycle(&total);
        Ok(total)
    }

    async fn run_pass(&self) -> Result<SyncSummary, AppError> {
        let entries = self.queue.drain().await?;
        let mut summary = SyncSummary::default();

        if entries.is_empty() {
            return Ok(summary);
        }

        tracing::info!(entries = entries.len(), "Sync pass started");

        for entry in entries {
            if self.cancel_requested.load(Ordering::SeqCst) {
                summary.cancelled = true;
                tracing::info!("Sync pass cancelled");
                break;
            }
            if !self.connectivity.is_online() {
                tracing::info!("Connectivity lost; stopping sync pass");
                break;
            }

            match self.replay(&entry).await {
                Ok(server_id) => {
                    let removed = self.queue.acknowledge(&entry, server_id.as_deref()).await?;
                    if !removed {
                        tracing::debug!(
                            entry_id = %entry.id,
                            "Entity changed during replay; newer snapshot stays queued"
                        );
                    }
                    summary.succeeded += 1;
                }
                Err(err) => {
                    self.book_failure(&entry, &err).await?;
                    summary.failed += 1;
                }
            }
        }

        tracing::info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Sync pass finished"
        );
        Ok(summary)
    }

    async fn replay(&self, entry: &SyncQueueEntry) -> Result<Option<String>, AppError> {
        let server_id = self
            .records
            .get(&entry.entity_id)
            .await?
            .and_then(|record| record.server_id);

        if entry.operation == Operation::Delete && server_id.is_none() {
            // The backend never saw this entity.
            return Ok(None);
        }

        let request = GatewayRequest::from_entry(entry, server_id);
        let call = gateway::dispatch(self.gateway.as_ref(), entry.entity_type, &request);

        match tokio::time::timeout(self.policy.replay_timeout, call).await {
            Ok(result) => result.into_result(),
            Err(_) => Err(AppError::Network(format!(
                "Replay timed out after {:?}",
                self.policy.replay_timeout
            ))),
        }
    }

    async fn book_failure(&self, entry: &SyncQueueEntry, err: &AppError) -> Result<(), AppError> {
        let now = self.clock.now();
        let message = err.to_string();

        let booked = if self.policy.fast_fail_permanent && !err.is_transient() {
            self.queue
                .record_permanent_failure(entry, &message, now)
                .await?
        } else {
            self.queue.record_failure(entry, &message, now).await?
        };

        let Some(updated) = booked else {
            tracing::warn!(
                entry_id = %entry.id,
                entity_id = %entry.entity_id,
                transient = err.is_transient(),
                "Replay of a superseded snapshot failed; newer snapshot stays queued: {}",
                err
            );
            return Ok(());
        };

        tracing::warn!(
            entry_id = %entry.id,
            entity_type = entry.entity_type.as_str(),
            entity_id = %entry.entity_id,
            retry_count = updated.retry_count,
            max_retries = updated.max_retries,
            transient = err.is_transient(),
            "Replay failed: {}",
            err
        );
        if updated.is_exhausted() {
            tracing::warn!(entry_id = %entry.id, "Queue entry exhausted its retries");
        }

        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        status.last_error = Some(ErrorDetails::from(err));
        Ok(())
    }

    fn finish_cycle(&self, summary: &SyncSummary) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        status.last_sync_at = Some(self.clock.now());
        if summary.failed == 0 && summary.succeeded > 0 {
            status.last_error = None;
        }
    }

    /// Snapshot of unsynced work and the last outcome, for UI banners.
    pub async fn sync_state(&self) -> Result<SyncState, AppError> {
        let unsynced_count = self.records.count_unsynced().await?;
        let drainable_count = self.queue.count_drainable().await?;
        let permanently_failed = self.queue.permanently_failed().await?;

        let status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        Ok(SyncState {
            unsynced_count,
            drainable_count,
            permanently_failed,
            last_sync_at: status.last_sync_at,
            last_error: status.last_error.clone(),
            is_syncing: self.is_running(),
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::gateway::GatewayResult;

    /// Gateway that succeeds unless an entity id has a scripted failure.
    #[derive(Default)]
    pub struct ScriptedGateway {
        pub calls: AtomicUsize,
        pub failures: Mutex<HashMap<String, GatewayResult>>,
        pub requests: Mutex<Vec<GatewayRequest>>,
        pub delay: Option<Duration>,
    }

    impl ScriptedGateway {
        pub fn with_delay(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        pub fn fail(&self, entity_id: &str, result: GatewayResult) {
            self.failures
                .lock()
                .unwrap()
                .insert(entity_id.to_string(), result);
        }

        pub fn heal(&self, entity_id: &str) {
            self.failures.lock().unwrap().remove(entity_id);
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        async fn handle(&self, request: &GatewayRequest) -> GatewayResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let scripted = self.failures.lock().unwrap().get(&request.entity_id).cloned();
            scripted.unwrap_or_else(|| {
                GatewayResult::success(Some(
                    request
                        .server_id
                        .clone()
                        .unwrap_or_else(|| format!("srv-{}", request.entity_id)),
                ))
            })
        }
    }

    #[async_trait]
    impl RemoteGateway for ScriptedGateway {
        async fn submit_scheduling(&self, request: &GatewayRequest) -> GatewayResult {
            self.handle(request).await
        }

        async fn submit_site_preparation(&self, request: &GatewayRequest) -> GatewayResult {
            self.handle(request).await
        }

        async fn submit_emptying_service(&self, request: &GatewayRequest) -> GatewayResult {
            self.handle(request).await
        }

        async fn submit_building_survey(&self, request: &GatewayRequest) -> GatewayResult {
            self.handle(request).await
        }
    }
}
