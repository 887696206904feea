//! Remote gateway contract.
//!
//! The sync engine only sees [`RemoteGateway`]: one call per entity type taking a
//! normalized request and returning a structured result. How those calls map to
//! HTTP lives in [`HttpGateway`].

mod http;

pub use http::HttpGateway;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{codes, AppError};
use crate::models::{EntityType, Operation, SyncQueueEntry};

/// Normalized mutation handed to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayRequest {
    pub entity_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    pub operation: Operation,
    pub payload: serde_json::Value,
}

impl GatewayRequest {
    pub fn from_entry(entry: &SyncQueueEntry, server_id: Option<String>) -> Self {
        Self {
            entity_id: entry.entity_id.clone(),
            server_id,
            operation: entry.operation,
            payload: entry.payload.clone(),
        }
    }
}

/// Structured outcome of a gateway call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// HTTP status when the backend answered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl GatewayResult {
    pub fn success(server_id: Option<String>) -> Self {
        Self {
            ok: true,
            server_id,
            ..Self::default()
        }
    }

    pub fn failure(status: Option<u16>, code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            status,
            error_code: code,
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Convert into a `Result`, classifying failures for the retry policy.
    pub fn into_result(self) -> Result<Option<String>, AppError> {
        if self.ok {
            return Ok(self.server_id);
        }

        let message = self
            .error_message
            .unwrap_or_else(|| "Remote call failed".to_string());

        match self.error_code.as_deref() {
            Some(codes::NETWORK_ERROR) => Err(AppError::Network(message)),
            Some(codes::SERIALIZATION_ERROR) => Err(AppError::Serialization(message)),
            _ => Err(AppError::Remote {
                status: self.status,
                code: self.error_code,
                message,
            }),
        }
    }
}

impl From<AppError> for GatewayResult {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Remote {
                status,
                code,
                message,
            } => GatewayResult::failure(status, code, message),
            other => GatewayResult::failure(
                None,
                Some(other.error_code().to_string()),
                other.message(),
            ),
        }
    }
}

/// Backend API as seen by the sync engine.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn submit_scheduling(&self, request: &GatewayRequest) -> GatewayResult;

    async fn submit_site_preparation(&self, request: &GatewayRequest) -> GatewayResult;

    async fn submit_emptying_service(&self, request: &GatewayRequest) -> GatewayResult;

    async fn submit_building_survey(&self, request: &GatewayRequest) -> GatewayResult;
}

/// Route a request to the gateway method for its entity type.
pub async fn dispatch(
    gateway: &dyn RemoteGateway,
    entity_type: EntityType,
    request: &GatewayRequest,
) -> GatewayResult {
    match entity_type {
        EntityType::Scheduling => gateway.submit_scheduling(request).await,
        EntityType::SitePreparation => gateway.submit_site_preparation(request).await,
        EntityType::EmptyingService => gateway.submit_emptying_service(request).await,
        EntityType::BuildingSurvey => gateway.submit_building_survey(request).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingGateway {
        calls: Mutex<Vec<&'static str>>,
    }

    impl RecordingGateway {
        fn record(&self, method: &'static str) -> GatewayResult {
            self.calls.lock().unwrap().push(method);
            GatewayResult::success(Some(format!("srv-{}", method)))
        }
    }

    #[async_trait]
    impl RemoteGateway for RecordingGateway {
        async fn submit_scheduling(&self, _request: &GatewayRequest) -> GatewayResult {
            self.record("scheduling")
        }

        async fn submit_site_preparation(&self, _request: &GatewayRequest) -> GatewayResult {
            self.record("site_preparation")
        }

        async fn submit_emptying_service(&self, _request: &GatewayRequest) -> GatewayResult {
            self.record("emptying_service")
        }

        async fn submit_building_survey(&self, _request: &GatewayRequest) -> GatewayResult {
            self.record("building_survey")
        }
    }

    #[tokio::test]
    async fn test_dispatch_routes_every_entity_type() {
        let gateway = RecordingGateway::default();
        let request = GatewayRequest {
            entity_id: "local-1".to_string(),
            server_id: None,
            operation: Operation::Create,
            payload: serde_json::json!({}),
        };

        for entity_type in EntityType::ALL {
            let result = dispatch(&gateway, entity_type, &request).await;
            assert_eq!(
                result.server_id,
                Some(format!("srv-{}", entity_type.as_str()))
            );
        }

        let calls = gateway.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "scheduling",
                "site_preparation",
                "emptying_service",
                "building_survey"
            ]
        );
    }

    #[test]
    fn test_failure_classification() {
        let network = GatewayResult::from(AppError::Network("timed out".to_string()));
        let err = network.into_result().unwrap_err();
        assert!(matches!(err, AppError::Network(_)));
        assert!(err.is_transient());

        let rejected = GatewayResult::failure(
            Some(422),
            Some("VALIDATION_ERROR".to_string()),
            "pit depth missing",
        );
        let err = rejected.into_result().unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(err.message(), "pit depth missing");

        assert_eq!(
            GatewayResult::success(Some("42".to_string())).into_result(),
            Ok(Some("42".to_string()))
        );
    }
}
