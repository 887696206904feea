//! Local record storage.
//!
//! Records are written together with their sync queue entry inside one transaction,
//! so a mutation is either fully captured or rejected with a storage error.

use std::sync::Arc;

use sqlx::{Row, SqliteConnection, SqlitePool};

use super::{from_millis, queue, to_millis};
use crate::clock::Clock;
use crate::errors::AppError;
use crate::models::{EntityType, Mutation, Operation, Record, SyncStatus};

const RECORD_COLUMNS: &str =
    "id, entity_type, server_id, payload, sync_status, created_at, updated_at, deleted";

/// Durable store for domain records.
#[derive(Clone)]
pub struct RecordStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    max_retries: i64,
}

impl RecordStore {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>, max_retries: i64) -> Self {
        Self {
            pool,
            clock,
            max_retries,
        }
    }

    /// Save a record locally without queueing it for sync.
    pub async fn save_draft(
        &self,
        entity_type: EntityType,
        payload: serde_json::Value,
    ) -> Result<Record, AppError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = self.clock.now();
        let payload_json = serde_json::to_string(&payload)?;

        sqlx::query(
            "INSERT INTO records (id, entity_type, server_id, payload, sync_status, created_at, updated_at, deleted) VALUES (?, ?, NULL, ?, ?, ?, ?, 0)"
        )
        .bind(&id)
        .bind(entity_type.as_str())
        .bind(&payload_json)
        .bind(SyncStatus::Draft.as_str())
        .bind(to_millis(now))
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        Ok(Record {
            id,
            entity_type,
            server_id: None,
            payload,
            sync_status: SyncStatus::Draft,
            created_at: now,
            updated_at: now,
            deleted: false,
        })
    }

    /// Replace the payload of a draft. Submitted records change through mutations only.
    pub async fn update_draft(
        &self,
        id: &str,
        payload: serde_json::Value,
    ) -> Result<Record, AppError> {
        let now = self.clock.now();
        let payload_json = serde_json::to_string(&payload)?;

        let result = sqlx::query(
            "UPDATE records SET payload = ?, updated_at = ? WHERE id = ? AND sync_status = ? AND deleted = 0",
        )
        .bind(&payload_json)
        .bind(to_millis(now))
        .bind(id)
        .bind(SyncStatus::Draft.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get(id).await? {
                Some(_) => Err(AppError::Validation(format!(
                    "Record {} is not an editable draft",
                    id
                ))),
                None => Err(AppError::NotFound(format!("Record {} not found", id))),
            };
        }

        self.get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Record {} not found", id)))
    }

    /// Apply a local mutation: update the record, mark it PENDING and queue it.
    ///
    /// Both writes share a transaction. Any storage error is returned and nothing
    /// is queued.
    pub async fn apply_mutation(&self, mutation: &Mutation) -> Result<Record, AppError> {
        if mutation.entity_id.trim().is_empty() {
            return Err(AppError::Validation("Entity id is required".to_string()));
        }

        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        let existing = fetch_record(&mut tx, &mutation.entity_id).await?;
        if let Some(record) = &existing {
            if record.entity_type != mutation.entity_type {
                return Err(AppError::Validation(format!(
                    "Record {} is a {}, not a {}",
                    record.id,
                    record.entity_type.as_str(),
                    mutation.entity_type.as_str()
                )));
            }
        }

        let record = match (mutation.operation, existing) {
            (Operation::Create, None) => {
                let payload_json = serde_json::to_string(&mutation.payload)?;
                sqlx::query(
                    "INSERT INTO records (id, entity_type, server_id, payload, sync_status, created_at, updated_at, deleted) VALUES (?, ?, NULL, ?, ?, ?, ?, 0)"
                )
                .bind(&mutation.entity_id)
                .bind(mutation.entity_type.as_str())
                .bind(&payload_json)
                .bind(SyncStatus::Pending.as_str())
                .bind(to_millis(now))
                .bind(to_millis(now))
                .execute(&mut *tx)
                .await?;

                queue::upsert_entry(
                    &mut tx,
                    mutation.entity_type,
                    &mutation.entity_id,
                    Operation::Create,
                    &mutation.payload,
                    mutation.priority,
                    self.max_retries,
                    now,
                )
                .await?;

                Record {
                    id: mutation.entity_id.clone(),
                    entity_type: mutation.entity_type,
                    server_id: None,
                    payload: mutation.payload.clone(),
                    sync_status: SyncStatus::Pending,
                    created_at: now,
                    updated_at: now,
                    deleted: false,
                }
            }
            (_, None) => {
                return Err(AppError::NotFound(format!(
                    "Record {} not found",
                    mutation.entity_id
                )));
            }
            (_, Some(record)) if record.deleted => {
                return Err(AppError::Validation(format!(
                    "Record {} has been deleted",
                    record.id
                )));
            }
            (Operation::Create, Some(record))
                if record.sync_status == SyncStatus::Synced || record.server_id.is_some() =>
            {
                return Err(AppError::Validation(format!(
                    "Record {} already exists on the server",
                    record.id
                )));
            }
            (Operation::Delete, Some(record)) if record.sync_status == SyncStatus::Draft => {
                // Never left the device, nothing to replay.
                sqlx::query("UPDATE records SET deleted = 1, updated_at = ? WHERE id = ?")
                    .bind(to_millis(now))
                    .bind(&record.id)
                    .execute(&mut *tx)
                    .await?;

                Record {
                    deleted: true,
                    updated_at: now,
                    ..record
                }
            }
            (operation, Some(record)) => {
                // A submitted draft has never reached the server.
                let operation = if record.sync_status == SyncStatus::Draft {
                    Operation::Create
                } else {
                    operation
                };
                let deleted = operation == Operation::Delete;
                let payload = if deleted && mutation.payload.is_null() {
                    record.payload.clone()
                } else {
                    mutation.payload.clone()
                };
                let payload_json = serde_json::to_string(&payload)?;

                sqlx::query(
                    "UPDATE records SET payload = ?, sync_status = ?, deleted = ?, updated_at = ? WHERE id = ?",
                )
                .bind(&payload_json)
                .bind(SyncStatus::Pending.as_str())
                .bind(deleted as i32)
                .bind(to_millis(now))
                .bind(&record.id)
                .execute(&mut *tx)
                .await?;

                queue::upsert_entry(
                    &mut tx,
                    record.entity_type,
                    &record.id,
                    operation,
                    &payload,
                    mutation.priority,
                    self.max_retries,
                    now,
                )
                .await?;

                Record {
                    payload,
                    sync_status: SyncStatus::Pending,
                    deleted,
                    updated_at: now,
                    ..record
                }
            }
        };

        tx.commit().await?;

        tracing::debug!(
            entity_type = mutation.entity_type.as_str(),
            entity_id = %mutation.entity_id,
            operation = mutation.operation.as_str(),
            "Mutation recorded"
        );

        Ok(record)
    }

    /// Get a record by ID.
    pub async fn get(&self, id: &str) -> Result<Option<Record>, AppError> {
        let mut conn = self.pool.acquire().await?;
        fetch_record(&mut conn, id).await
    }

    /// List live records in any of the given states, oldest first.
    pub async fn list_by_status(
        &self,
        entity_type: Option<EntityType>,
        statuses: &[SyncStatus],
    ) -> Result<Vec<Record>, AppError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; statuses.len()].join(", ");
        let mut sql = format!(
            "SELECT {} FROM records WHERE deleted = 0 AND sync_status IN ({})",
            RECORD_COLUMNS, placeholders
        );
        if entity_type.is_some() {
            sql.push_str(" AND entity_type = ?");
        }
        sql.push_str(" ORDER BY created_at ASC, rowid ASC");

        let mut query = sqlx::query(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        if let Some(entity_type) = entity_type {
            query = query.bind(entity_type.as_str());
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Number of records still waiting to reach the backend (PENDING or FAILED).
    pub async fn count_unsynced(&self) -> Result<u64, AppError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE sync_status IN (?, ?)")
                .bind(SyncStatus::Pending.as_str())
                .bind(SyncStatus::Failed.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }
}

pub(crate) async fn fetch_record(
    conn: &mut SqliteConnection,
    id: &str,
) -> Result<Option<Record>, AppError> {
    let row = sqlx::query(&format!("SELECT {} FROM records WHERE id = ?", RECORD_COLUMNS))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    row.as_ref().map(record_from_row).transpose()
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Record, AppError> {
    let entity_type: String = row.get("entity_type");
    let sync_status: String = row.get("sync_status");
    let payload: String = row.get("payload");
    let deleted: i32 = row.get("deleted");

    Ok(Record {
        id: row.get("id"),
        entity_type: entity_type.parse()?,
        server_id: row.get("server_id"),
        payload: serde_json::from_str(&payload)?,
        sync_status: sync_status.parse()?,
        created_at: from_millis(row.get("created_at"))?,
        updated_at: from_millis(row.get("updated_at"))?,
        deleted: deleted != 0,
    })
}
