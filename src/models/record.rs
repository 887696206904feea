//! Local domain records and the mutations applied to them.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::AppError;

/// Kind of field form a record holds. Each kind has its own backend endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Scheduling,
    SitePreparation,
    EmptyingService,
    BuildingSurvey,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [
        EntityType::Scheduling,
        EntityType::SitePreparation,
        EntityType::EmptyingService,
        EntityType::BuildingSurvey,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Scheduling => "scheduling",
            EntityType::SitePreparation => "site_preparation",
            EntityType::EmptyingService => "emptying_service",
            EntityType::BuildingSurvey => "building_survey",
        }
    }
}

impl FromStr for EntityType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduling" => Ok(EntityType::Scheduling),
            "site_preparation" => Ok(EntityType::SitePreparation),
            "emptying_service" => Ok(EntityType::EmptyingService),
            "building_survey" => Ok(EntityType::BuildingSurvey),
            other => Err(AppError::InvalidEntityType(format!(
                "Unknown entity type '{}'",
                other
            ))),
        }
    }
}

/// Sync lifecycle of a local record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    /// Saved locally, not submitted yet
    Draft,
    /// Submitted, waiting in the sync queue
    Pending,
    /// Accepted by the backend
    Synced,
    /// Last replay failed; still queued
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Draft => "DRAFT",
            SyncStatus::Pending => "PENDING",
            SyncStatus::Synced => "SYNCED",
            SyncStatus::Failed => "FAILED",
        }
    }

    /// Records in these states own exactly one sync queue entry.
    pub fn is_queued(&self) -> bool {
        matches!(self, SyncStatus::Pending | SyncStatus::Failed)
    }
}

impl FromStr for SyncStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRAFT" => Ok(SyncStatus::Draft),
            "PENDING" => Ok(SyncStatus::Pending),
            "SYNCED" => Ok(SyncStatus::Synced),
            "FAILED" => Ok(SyncStatus::Failed),
            other => Err(AppError::Internal(format!("Unknown sync status '{}'", other))),
        }
    }
}

/// Kind of change a queued mutation replays.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }

    /// Resolve the operation to keep when a mutation replaces a queued one.
    ///
    /// The backend has not seen a queued CREATE yet, so a later UPDATE must still
    /// be sent as a CREATE. Everything else is latest-write-wins.
    pub fn coalesce(queued: Operation, incoming: Operation) -> Operation {
        match (queued, incoming) {
            (Operation::Create, Operation::Update) => Operation::Create,
            (_, incoming) => incoming,
        }
    }
}

impl FromStr for Operation {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(Operation::Create),
            "UPDATE" => Ok(Operation::Update),
            "DELETE" => Ok(Operation::Delete),
            other => Err(AppError::Internal(format!("Unknown operation '{}'", other))),
        }
    }
}

/// A locally stored domain entity (scheduling form, survey, service form).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub entity_type: EntityType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    pub payload: serde_json::Value,
    pub sync_status: SyncStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted: bool,
}

/// A local change the UI wants replayed against the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: Operation,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: i64,
}

impl Mutation {
    /// Create a new entity with a freshly generated local id.
    pub fn create(entity_type: EntityType, payload: serde_json::Value) -> Self {
        Self {
            entity_type,
            entity_id: uuid::Uuid::new_v4().to_string(),
            operation: Operation::Create,
            payload,
            priority: 0,
        }
    }

    pub fn update(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            operation: Operation::Update,
            payload,
            priority: 0,
        }
    }

    pub fn delete(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            operation: Operation::Delete,
            payload: serde_json::Value::Null,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}
