//! Background driver for the sync engine.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use super::SyncEngine;
use crate::models::SkipReason;

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt - 1)`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(max)
}

/// Runs sync cycles when triggered and retries failed cycles with backoff.
///
/// Triggers that arrive while a cycle is running collapse into a single follow-up cycle.
pub struct SyncWorker {
    trigger: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SyncWorker {
    pub fn spawn(engine: Arc<SyncEngine>, backoff_base: Duration, backoff_max: Duration) -> Self {
        let trigger = Arc::new(Notify::new());
        let (shutdown, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run(
            engine,
            trigger.clone(),
            shutdown_rx,
            backoff_base,
            backoff_max,
        ));

        Self {
            trigger,
            shutdown,
            handle,
        }
    }

    /// Ask for a sync cycle (app start, connectivity regained, manual refresh).
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Stop the worker after the cycle in progress, if any, completes.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            tracing::error!("Sync worker task failed: {}", e);
        }
    }
}

async fn run(
    engine: Arc<SyncEngine>,
    trigger: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
    backoff_base: Duration,
    backoff_max: Duration,
) {
    tracing::info!("Sync worker started");

    let mut consecutive_failures: u32 = 0;
    let mut retry_after: Option<Duration> = None;

    loop {
        let retry_sleep = tokio::time::sleep(retry_after.unwrap_or(Duration::ZERO));
        tokio::pin!(retry_sleep);

        tokio::select! {
            _ = trigger.notified() => {}
            _ = &mut retry_sleep, if retry_after.is_some() => {
                tracing::debug!(attempt = consecutive_failures, "Retrying sync after backoff");
            }
            _ = shutdown.changed() => break,
        }

        if *shutdown.borrow() {
            break;
        }

        match engine.run_sync_cycle().await {
            Ok(summary) if summary.skipped == Some(SkipReason::Offline) => {
                // Wait for the next connectivity trigger instead of polling.
                retry_after = None;
            }
            Ok(summary) if summary.failed > 0 => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                let delay = backoff_delay(backoff_base, backoff_max, consecutive_failures);
                tracing::info!(
                    failed = summary.failed,
                    delay_ms = delay.as_millis() as u64,
                    "Sync cycle had failures; backing off"
                );
                retry_after = Some(delay);
            }
            Ok(_) => {
                consecutive_failures = 0;
                retry_after = None;
            }
            Err(e) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                let delay = backoff_delay(backoff_base, backoff_max, consecutive_failures);
                tracing::error!("Sync cycle aborted: {}", e);
                retry_after = Some(delay);
            }
        }
    }

    tracing::info!("Sync worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, SystemClock};
    use crate::connectivity::SharedConnectivity;
    use crate::db::test_support::test_pool;
    use crate::db::{RecordStore, SyncQueue};
    use crate::models::{EntityType, Mutation};
    use crate::sync::test_support::ScriptedGateway;
    use crate::sync::RetryPolicy;
    use serde_json::json;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(60);

        assert_eq!(backoff_delay(base, max, 1), Duration::from_secs(5));
        assert_eq!(backoff_delay(base, max, 2), Duration::from_secs(10));
        assert_eq!(backoff_delay(base, max, 4), Duration::from_secs(40));
        assert_eq!(backoff_delay(base, max, 5), max);
        assert_eq!(backoff_delay(base, max, 400), max);
    }

    #[tokio::test]
    async fn test_trigger_runs_cycle_and_shutdown_stops_worker() {
        let (pool, _temp_dir) = test_pool().await;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let records = RecordStore::new(pool.clone(), clock.clone(), 3);
        let queue = SyncQueue::new(pool, clock.clone(), 3);
        let gateway = Arc::new(ScriptedGateway::default());

        let engine = Arc::new(SyncEngine::new(
            records.clone(),
            queue.clone(),
            gateway.clone(),
            Arc::new(SharedConnectivity::new(true)),
            clock,
            RetryPolicy::default(),
        ));

        records
            .apply_mutation(&Mutation::create(EntityType::SitePreparation, json!({})))
            .await
            .unwrap();

        let worker = SyncWorker::spawn(
            engine,
            Duration::from_millis(10),
            Duration::from_millis(100),
        );
        worker.trigger();
        worker.trigger();

        for _ in 0..50 {
            if queue.count_drainable().await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(queue.count_drainable().await.unwrap(), 0);
        assert_eq!(gateway.call_count(), 1);

        worker.shutdown().await;
    }
}
