//! Error handling module for the sync core.
//!
//! Provides a centralized error type with stable codes and a transient/permanent
//! classification used by the sync engine's retry policy.

use serde::{Deserialize, Serialize};

/// Error codes as constants to avoid stringly-typed errors.
pub mod codes {
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const DATABASE_ERROR: &str = "DATABASE_ERROR";
    pub const NETWORK_ERROR: &str = "NETWORK_ERROR";
    pub const REMOTE_ERROR: &str = "REMOTE_ERROR";
    pub const SERIALIZATION_ERROR: &str = "SERIALIZATION_ERROR";
    pub const INVALID_ENTITY_TYPE: &str = "INVALID_ENTITY_TYPE";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Application error type.
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Record, queue entry or area download not found
    NotFound(String),
    /// Caller supplied invalid input
    Validation(String),
    /// Local storage failure; the mutation was not persisted
    Database(String),
    /// Network unreachable or timed out
    Network(String),
    /// Backend rejected or failed the request
    Remote {
        status: Option<u16>,
        code: Option<String>,
        message: String,
    },
    /// Payload could not be (de)serialized
    Serialization(String),
    /// Stored entity type tag is not one we know about
    InvalidEntityType(String),
    /// Anything else
    Internal(String),
}

impl AppError {
    /// Get the error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => codes::NOT_FOUND,
            AppError::Validation(_) => codes::VALIDATION_ERROR,
            AppError::Database(_) => codes::DATABASE_ERROR,
            AppError::Network(_) => codes::NETWORK_ERROR,
            AppError::Remote { .. } => codes::REMOTE_ERROR,
            AppError::Serialization(_) => codes::SERIALIZATION_ERROR,
            AppError::InvalidEntityType(_) => codes::INVALID_ENTITY_TYPE,
            AppError::Internal(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Get the error message.
    pub fn message(&self) -> String {
        match self {
            AppError::NotFound(msg) => msg.clone(),
            AppError::Validation(msg) => msg.clone(),
            AppError::Database(msg) => msg.clone(),
            AppError::Network(msg) => msg.clone(),
            AppError::Remote { message, .. } => message.clone(),
            AppError::Serialization(msg) => msg.clone(),
            AppError::InvalidEntityType(msg) => msg.clone(),
            AppError::Internal(msg) => msg.clone(),
        }
    }

    /// Whether retrying the same request later could succeed.
    ///
    /// Network failures, 5xx, 408 and 429 are transient. Other 4xx responses and
    /// malformed payloads are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Network(_) | AppError::Database(_) | AppError::Internal(_) => true,
            AppError::Remote { status, .. } => match status {
                Some(code) => *code >= 500 || *code == 408 || *code == 429,
                None => true,
            },
            AppError::NotFound(_)
            | AppError::Validation(_)
            | AppError::Serialization(_)
            | AppError::InvalidEntityType(_) => false,
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::Remote {
                status: Some(status),
                ..
            } => write!(f, "{} ({}): {}", self.error_code(), status, self.message()),
            _ => write!(f, "{}: {}", self.error_code(), self.message()),
        }
    }
}

impl std::error::Error for AppError {}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        AppError::Database(format!("Database error: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        tracing::error!("JSON error: {:?}", err);
        AppError::Serialization(format!("JSON error: {}", err))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return AppError::Remote {
                status: Some(status.as_u16()),
                code: None,
                message: format!("HTTP error: {}", err),
            };
        }
        if err.is_decode() {
            return AppError::Serialization(format!("Response decode error: {}", err));
        }
        AppError::Network(format!("Network error: {}", err))
    }
}

/// Serializable error summary exposed to the UI (e.g. the last sync error banner).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
    pub transient: bool,
}

impl From<&AppError> for ErrorDetails {
    fn from(err: &AppError) -> Self {
        Self {
            code: err.error_code().to_string(),
            message: err.message(),
            transient: err.is_transient(),
        }
    }
}
