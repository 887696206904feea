//! Durable sync queue.
//!
//! Holds at most one entry per (entity_type, entity_id). Re-enqueueing an entity
//! replaces the stored snapshot in place, keeping the entry's original position.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection, SqlitePool};

use super::{from_millis, to_millis};
use crate::clock::Clock;
use crate::errors::AppError;
use crate::models::{EntityType, Operation, SyncQueueEntry, SyncStatus};

const ENTRY_COLUMNS: &str = "id, entity_type, entity_id, operation, payload, retry_count, max_retries, last_attempt, error_message, created_at, priority, revision";

/// Fair drain order: higher priority first, oldest first within a priority band.
const DRAIN_ORDER: &str = "ORDER BY priority DESC, created_at ASC, rowid ASC";

/// Queue of mutations awaiting replay.
#[derive(Clone)]
pub struct SyncQueue {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    max_retries: i64,
}

impl SyncQueue {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>, max_retries: i64) -> Self {
        Self {
            pool,
            clock,
            max_retries,
        }
    }

    pub fn max_retries(&self) -> i64 {
        self.max_retries
    }

    /// Queue a mutation snapshot, replacing any outstanding entry for the same entity.
    pub async fn enqueue(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        operation: Operation,
        payload: &serde_json::Value,
        priority: i64,
    ) -> Result<String, AppError> {
        let mut tx = self.pool.begin().await?;
        let id = upsert_entry(
            &mut tx,
            entity_type,
            entity_id,
            operation,
            payload,
            priority,
            self.max_retries,
            self.clock.now(),
        )
        .await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Entries still eligible for replay, in drain order.
    pub async fn drain(&self) -> Result<Vec<SyncQueueEntry>, AppError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM sync_queue WHERE retry_count < max_retries {}",
            ENTRY_COLUMNS, DRAIN_ORDER
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    /// Entries that exhausted their retries. They are kept as an audit trail.
    pub async fn permanently_failed(&self) -> Result<Vec<SyncQueueEntry>, AppError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM sync_queue WHERE retry_count >= max_retries {}",
            ENTRY_COLUMNS, DRAIN_ORDER
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    /// Number of entries the next drain would return.
    pub async fn count_drainable(&self) -> Result<u64, AppError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sync_queue WHERE retry_count < max_retries")
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    /// Get an entry by ID.
    pub async fn get(&self, entry_id: &str) -> Result<Option<SyncQueueEntry>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM sync_queue WHERE id = ?",
            ENTRY_COLUMNS
        ))
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(entry_from_row).transpose()
    }

    /// Get the outstanding entry for an entity, if any.
    pub async fn find(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<SyncQueueEntry>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM sync_queue WHERE entity_type = ? AND entity_id = ?",
            ENTRY_COLUMNS
        ))
        .bind(entity_type.as_str())
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(entry_from_row).transpose()
    }

    /// Count a failed replay of exactly this snapshot of `entry`: bump the retry
    /// counter and mark the record FAILED.
    ///
    /// Returns `None` when the entity was re-enqueued (or the entry discarded) while
    /// the replay was in flight. The newer snapshot keeps its fresh retry budget and
    /// the record stays PENDING.
    pub async fn record_failure(
        &self,
        entry: &SyncQueueEntry,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SyncQueueEntry>, AppError> {
        self.fail_entry(entry, error_message, now, false).await
    }

    /// Like [`record_failure`](Self::record_failure) but spends the whole retry budget.
    pub async fn record_permanent_failure(
        &self,
        entry: &SyncQueueEntry,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SyncQueueEntry>, AppError> {
        self.fail_entry(entry, error_message, now, true).await
    }

    async fn fail_entry(
        &self,
        entry: &SyncQueueEntry,
        error_message: &str,
        now: DateTime<Utc>,
        exhaust: bool,
    ) -> Result<Option<SyncQueueEntry>, AppError> {
        let mut tx = self.pool.begin().await?;

        let retry_expr = if exhaust {
            "MAX(retry_count + 1, max_retries)"
        } else {
            "retry_count + 1"
        };
        let row = sqlx::query(&format!(
            "UPDATE sync_queue SET retry_count = {}, last_attempt = ?, error_message = ? WHERE id = ? AND revision = ? RETURNING {}",
            retry_expr, ENTRY_COLUMNS
        ))
        .bind(to_millis(now))
        .bind(error_message)
        .bind(&entry.id)
        .bind(entry.revision)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let updated = entry_from_row(&row)?;

        set_record_status(&mut tx, &updated, SyncStatus::Failed).await?;

        tx.commit().await?;
        Ok(Some(updated))
    }

    /// Acknowledge a successful replay: drop the entry and mark the record SYNCED.
    pub async fn record_success(&self, entry_id: &str) -> Result<(), AppError> {
        let entry = self
            .get(entry_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Queue entry {} not found", entry_id)))?;
        self.acknowledge(&entry, None).await?;
        Ok(())
    }

    /// Acknowledge the replay of exactly this snapshot of `entry`.
    ///
    /// If the entity was re-enqueued while the replay was in flight, the newer
    /// snapshot stays queued and the record stays PENDING; only the server id is
    /// kept. Returns whether the entry was removed.
    pub async fn acknowledge(
        &self,
        entry: &SyncQueueEntry,
        server_id: Option<&str>,
    ) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM sync_queue WHERE id = ? AND revision = ?")
            .bind(&entry.id)
            .bind(entry.revision)
            .execute(&mut *tx)
            .await?;
        let removed = result.rows_affected() > 0;

        if removed {
            sqlx::query(
                "UPDATE records SET sync_status = ?, server_id = COALESCE(?, server_id) WHERE id = ? AND entity_type = ?",
            )
            .bind(SyncStatus::Synced.as_str())
            .bind(server_id)
            .bind(&entry.entity_id)
            .bind(entry.entity_type.as_str())
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "UPDATE records SET server_id = COALESCE(?, server_id) WHERE id = ? AND entity_type = ?",
            )
            .bind(server_id)
            .bind(&entry.entity_id)
            .bind(entry.entity_type.as_str())
            .execute(&mut *tx)
            .await?;

            if entry.operation == Operation::Create {
                // The server has the entity now; the newer snapshot is an update.
                sqlx::query(
                    "UPDATE sync_queue SET operation = ? WHERE id = ? AND operation = ?",
                )
                .bind(Operation::Update.as_str())
                .bind(&entry.id)
                .bind(Operation::Create.as_str())
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(removed)
    }

    /// Give a parked entry a fresh retry budget.
    pub async fn retry(&self, entry_id: &str) -> Result<SyncQueueEntry, AppError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "UPDATE sync_queue SET retry_count = 0, error_message = NULL WHERE id = ? RETURNING {}",
            ENTRY_COLUMNS
        ))
        .bind(entry_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Queue entry {} not found", entry_id)))?;
        let entry = entry_from_row(&row)?;

        set_record_status(&mut tx, &entry, SyncStatus::Pending).await?;

        tx.commit().await?;
        Ok(entry)
    }

    /// Drop a queued mutation. The record goes back to being a local draft.
    pub async fn discard(&self, entry_id: &str) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "DELETE FROM sync_queue WHERE id = ? RETURNING {}",
            ENTRY_COLUMNS
        ))
        .bind(entry_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Queue entry {} not found", entry_id)))?;
        let entry = entry_from_row(&row)?;

        set_record_status(&mut tx, &entry, SyncStatus::Draft).await?;

        tx.commit().await?;
        Ok(())
    }
}

/// Insert or replace the outstanding entry for an entity on an open transaction.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn upsert_entry(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    entity_id: &str,
    operation: Operation,
    payload: &serde_json::Value,
    priority: i64,
    max_retries: i64,
    now: DateTime<Utc>,
) -> Result<String, AppError> {
    let payload_json = serde_json::to_string(payload)?;

    let existing = sqlx::query("SELECT id, operation FROM sync_queue WHERE entity_type = ? AND entity_id = ?")
        .bind(entity_type.as_str())
        .bind(entity_id)
        .fetch_optional(&mut *conn)
        .await?;

    if let Some(row) = existing {
        let id: String = row.get("id");
        let queued: String = row.get("operation");
        let operation = Operation::coalesce(queued.parse()?, operation);

        sqlx::query(
            "UPDATE sync_queue SET operation = ?, payload = ?, priority = ?, retry_count = 0, max_retries = ?, last_attempt = NULL, error_message = NULL, revision = revision + 1 WHERE id = ?",
        )
        .bind(operation.as_str())
        .bind(&payload_json)
        .bind(priority)
        .bind(max_retries)
        .bind(&id)
        .execute(&mut *conn)
        .await?;

        return Ok(id);
    }

    let id = uuid::Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO sync_queue (id, entity_type, entity_id, operation, payload, retry_count, max_retries, last_attempt, error_message, created_at, priority, revision) VALUES (?, ?, ?, ?, ?, 0, ?, NULL, NULL, ?, ?, 1)"
    )
    .bind(&id)
    .bind(entity_type.as_str())
    .bind(entity_id)
    .bind(operation.as_str())
    .bind(&payload_json)
    .bind(max_retries)
    .bind(to_millis(now))
    .bind(priority)
    .execute(&mut *conn)
    .await?;

    Ok(id)
}

async fn set_record_status(
    conn: &mut SqliteConnection,
    entry: &SyncQueueEntry,
    status: SyncStatus,
) -> Result<(), AppError> {
    sqlx::query("UPDATE records SET sync_status = ? WHERE id = ? AND entity_type = ?")
        .bind(status.as_str())
        .bind(&entry.entity_id)
        .bind(entry.entity_type.as_str())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<SyncQueueEntry, AppError> {
    let entity_type: String = row.get("entity_type");
    let operation: String = row.get("operation");
    let payload: String = row.get("payload");
    let last_attempt: Option<i64> = row.get("last_attempt");

    Ok(SyncQueueEntry {
        id: row.get("id"),
        entity_type: entity_type.parse()?,
        entity_id: row.get("entity_id"),
        operation: operation.parse()?,
        payload: serde_json::from_str(&payload)?,
        retry_count: row.get("retry_count"),
        max_retries: row.get("max_retries"),
        last_attempt: last_attempt.map(from_millis).transpose()?,
        error_message: row.get("error_message"),
        created_at: from_millis(row.get("created_at"))?,
        priority: row.get("priority"),
        revision: row.get("revision"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::test_support::test_pool;
    use crate::db::RecordStore;
    use crate::models::Mutation;
    use chrono::Duration;
    use serde_json::json;

    fn setup(pool: SqlitePool) -> (SyncQueue, RecordStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        ));
        (
            SyncQueue::new(pool.clone(), clock.clone(), 3),
            RecordStore::new(pool, clock.clone(), 3),
            clock,
        )
    }

    #[tokio::test]
    async fn test_drain_orders_by_priority_then_fifo() {
        let (pool, _temp_dir) = test_pool().await;
        let (queue, _records, clock) = setup(pool);

        queue
            .enqueue(EntityType::Scheduling, "a", Operation::Create, &json!({}), 0)
            .await
            .unwrap();
        clock.advance(Duration::seconds(1));
        queue
            .enqueue(EntityType::Scheduling, "b", Operation::Create, &json!({}), 5)
            .await
            .unwrap();
        clock.advance(Duration::seconds(1));
        queue
            .enqueue(EntityType::BuildingSurvey, "c", Operation::Create, &json!({}), 0)
            .await
            .unwrap();
        clock.advance(Duration::seconds(1));
        queue
            .enqueue(EntityType::EmptyingService, "d", Operation::Create, &json!({}), 5)
            .await
            .unwrap();

        let order: Vec<String> = queue
            .drain()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.entity_id)
            .collect();

        assert_eq!(order, vec!["b", "d", "a", "c"]);
    }

    #[tokio::test]
    async fn test_enqueue_same_entity_keeps_one_entry_with_latest_payload() {
        let (pool, _temp_dir) = test_pool().await;
        let (queue, _records, clock) = setup(pool);

        let first = queue
            .enqueue(
                EntityType::BuildingSurvey,
                "survey-1",
                Operation::Update,
                &json!({"rooms": 1}),
                0,
            )
            .await
            .unwrap();
        clock.advance(Duration::seconds(5));
        let second = queue
            .enqueue(
                EntityType::BuildingSurvey,
                "survey-1",
                Operation::Update,
                &json!({"rooms": 2}),
                0,
            )
            .await
            .unwrap();

        assert_eq!(first, second);
        let entries = queue.drain().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload, json!({"rooms": 2}));
        assert_eq!(entries[0].revision, 2);
        assert_eq!(
            entries[0].created_at,
            DateTime::from_timestamp(1_700_000_000, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_retry_bound_parks_entry() {
        let (pool, _temp_dir) = test_pool().await;
        let (queue, _records, clock) = setup(pool);

        let id = queue
            .enqueue(EntityType::Scheduling, "s-1", Operation::Create, &json!({}), 0)
            .await
            .unwrap();

        for attempt in 1..=3 {
            let current = queue.get(&id).await.unwrap().unwrap();
            let entry = queue
                .record_failure(&current, "timeout", clock.now())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(entry.retry_count, attempt);
            assert_eq!(entry.error_message.as_deref(), Some("timeout"));
            assert_eq!(entry.last_attempt, Some(clock.now()));
        }

        assert!(queue.drain().await.unwrap().is_empty());
        let parked = queue.permanently_failed().await.unwrap();
        assert_eq!(parked.len(), 1);
        assert!(parked[0].is_exhausted());
        assert!(queue.get(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_permanent_failure_exhausts_budget() {
        let (pool, _temp_dir) = test_pool().await;
        let (queue, _records, clock) = setup(pool);

        let id = queue
            .enqueue(EntityType::Scheduling, "s-1", Operation::Create, &json!({}), 0)
            .await
            .unwrap();
        let current = queue.get(&id).await.unwrap().unwrap();
        let entry = queue
            .record_permanent_failure(&current, "422 invalid", clock.now())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(entry.retry_count, 3);
        assert_eq!(queue.count_drainable().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failure_of_stale_snapshot_leaves_newer_one_alone() {
        let (pool, _temp_dir) = test_pool().await;
        let (queue, records, clock) = setup(pool);

        let mutation = Mutation::create(EntityType::BuildingSurvey, json!({"containment": null}));
        records.apply_mutation(&mutation).await.unwrap();
        let in_flight = queue.drain().await.unwrap().remove(0);

        records
            .apply_mutation(&Mutation::update(
                EntityType::BuildingSurvey,
                &mutation.entity_id,
                json!({"containment": "pit"}),
            ))
            .await
            .unwrap();

        let booked = queue
            .record_permanent_failure(&in_flight, "422 invalid", clock.now())
            .await
            .unwrap();
        assert!(booked.is_none());

        let queued = queue.get(&in_flight.id).await.unwrap().unwrap();
        assert_eq!(queued.revision, 2);
        assert_eq!(queued.retry_count, 0);
        assert!(queued.error_message.is_none());
        assert_eq!(queued.payload, json!({"containment": "pit"}));
        assert_eq!(queue.count_drainable().await.unwrap(), 1);

        let record = records.get(&mutation.entity_id).await.unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_record_success_empties_drain() {
        let (pool, _temp_dir) = test_pool().await;
        let (queue, records, _clock) = setup(pool);

        let record = records
            .apply_mutation(&Mutation::create(
                EntityType::BuildingSurvey,
                json!({"name": "survey-1"}),
            ))
            .await
            .unwrap();

        let entries = queue.drain().await.unwrap();
        assert_eq!(entries.len(), 1);

        queue.record_success(&entries[0].id).await.unwrap();

        assert!(queue.drain().await.unwrap().is_empty());
        let stored = records.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_acknowledge_keeps_newer_snapshot() {
        let (pool, _temp_dir) = test_pool().await;
        let (queue, records, _clock) = setup(pool);

        let mutation = Mutation::create(EntityType::Scheduling, json!({"slot": "am"}));
        records.apply_mutation(&mutation).await.unwrap();
        let in_flight = queue.drain().await.unwrap().remove(0);

        // User edits while the CREATE is being replayed.
        records
            .apply_mutation(&Mutation::update(
                EntityType::Scheduling,
                &mutation.entity_id,
                json!({"slot": "pm"}),
            ))
            .await
            .unwrap();

        let removed = queue.acknowledge(&in_flight, Some("srv-9")).await.unwrap();
        assert!(!removed);

        let remaining = queue.drain().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].operation, Operation::Update);
        assert_eq!(remaining[0].payload, json!({"slot": "pm"}));

        let record = records.get(&mutation.entity_id).await.unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert_eq!(record.server_id.as_deref(), Some("srv-9"));
    }

    #[tokio::test]
    async fn test_retry_and_discard_parked_entry() {
        let (pool, _temp_dir) = test_pool().await;
        let (queue, records, clock) = setup(pool);

        let mutation = Mutation::create(EntityType::EmptyingService, json!({}));
        records.apply_mutation(&mutation).await.unwrap();
        let entry = queue.drain().await.unwrap().remove(0);
        queue
            .record_permanent_failure(&entry, "rejected", clock.now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            records
                .get(&mutation.entity_id)
                .await
                .unwrap()
                .unwrap()
                .sync_status,
            SyncStatus::Failed
        );

        let retried = queue.retry(&entry.id).await.unwrap();
        assert_eq!(retried.retry_count, 0);
        assert_eq!(queue.count_drainable().await.unwrap(), 1);

        queue.discard(&entry.id).await.unwrap();
        assert!(queue.get(&entry.id).await.unwrap().is_none());
        let record = records.get(&mutation.entity_id).await.unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Draft);
    }
}
