//! Sync queue entry model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EntityType, Operation};

/// One outstanding mutation awaiting replay to the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueEntry {
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: Operation,
    /// Snapshot of the mutation payload at enqueue time
    pub payload: serde_json::Value,
    pub retry_count: i64,
    pub max_retries: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub priority: i64,
    /// Bumped every time the entry is re-enqueued with a newer snapshot
    pub revision: i64,
}

impl SyncQueueEntry {
    /// Exhausted entries stay in the queue as an audit trail but are never drained.
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}
