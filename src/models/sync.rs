//! Sync cycle outcomes and the state exposed to the UI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SyncQueueEntry;
use crate::errors::ErrorDetails;

/// Why a sync cycle did not touch the queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipReason {
    Offline,
    AlreadyRunning,
}

/// Aggregate result of one sync cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub succeeded: u32,
    pub failed: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<SkipReason>,
    pub cancelled: bool,
}

impl SyncSummary {
    pub fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }

    pub fn attempted(&self) -> u32 {
        self.succeeded + self.failed
    }

    pub(crate) fn absorb(&mut self, other: &SyncSummary) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.cancelled |= other.cancelled;
    }
}

/// Queryable sync state for banners and badges.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    /// Records in PENDING or FAILED state
    pub unsynced_count: u64,
    /// Queue entries that will be attempted on the next cycle
    pub drainable_count: u64,
    /// Entries that exhausted their retries and need user attention
    pub permanently_failed: Vec<SyncQueueEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorDetails>,
    pub is_syncing: bool,
}
