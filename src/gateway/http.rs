//! REST binding of the remote gateway.
//!
//! CREATE is `POST {base}/{collection}`, UPDATE is `PUT {base}/{collection}/{id}` and
//! DELETE is `DELETE {base}/{collection}/{id}`. Responses use the backend's
//! `{success, data, error}` envelope.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::json;

use super::{GatewayRequest, GatewayResult, RemoteGateway};
use crate::errors::AppError;
use crate::models::{EntityType, Operation};

#[derive(Debug, Deserialize)]
struct EnvelopeError {
    code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<EnvelopeError>,
}

/// Gateway talking to the backend over HTTP.
#[derive(Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpGateway {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn collection(entity_type: EntityType) -> &'static str {
        match entity_type {
            EntityType::Scheduling => "schedulings",
            EntityType::SitePreparation => "site-preparations",
            EntityType::EmptyingService => "emptying-services",
            EntityType::BuildingSurvey => "building-surveys",
        }
    }

    async fn send(&self, entity_type: EntityType, request: &GatewayRequest) -> GatewayResult {
        match self.try_send(entity_type, request).await {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(
                    entity_type = entity_type.as_str(),
                    entity_id = %request.entity_id,
                    "Gateway request failed: {}",
                    err
                );
                GatewayResult::from(err)
            }
        }
    }

    async fn try_send(
        &self,
        entity_type: EntityType,
        request: &GatewayRequest,
    ) -> Result<GatewayResult, AppError> {
        let collection = format!("{}/{}", self.base_url, Self::collection(entity_type));
        let remote_id = request.server_id.as_deref().unwrap_or(&request.entity_id);

        let (method, url) = match request.operation {
            Operation::Create => (Method::POST, collection),
            Operation::Update => (Method::PUT, format!("{}/{}", collection, remote_id)),
            Operation::Delete => (Method::DELETE, format!("{}/{}", collection, remote_id)),
        };

        let mut builder = self.client.request(method, &url);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        if request.operation != Operation::Delete {
            builder = builder.json(&json!({
                "localId": request.entity_id,
                "data": request.payload,
            }));
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        let envelope: Option<Envelope> = serde_json::from_str(&body).ok();

        if status.is_success() {
            let server_id = envelope
                .and_then(|e| e.data)
                .and_then(|data| extract_id(&data))
                .or_else(|| request.server_id.clone());
            return Ok(GatewayResult::success(server_id));
        }

        // Deleting something the server no longer has is what we wanted anyway.
        if status == StatusCode::NOT_FOUND && request.operation == Operation::Delete {
            return Ok(GatewayResult::success(request.server_id.clone()));
        }

        let (code, message) = match envelope.and_then(|e| e.error) {
            Some(error) => (
                error.code,
                error.message.unwrap_or_else(|| status.to_string()),
            ),
            None => (None, format!("HTTP {}", status)),
        };

        Ok(GatewayResult::failure(Some(status.as_u16()), code, message))
    }
}

fn extract_id(data: &serde_json::Value) -> Option<String> {
    match data.get("id")? {
        serde_json::Value::String(id) => Some(id.clone()),
        serde_json::Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    async fn submit_scheduling(&self, request: &GatewayRequest) -> GatewayResult {
        self.send(EntityType::Scheduling, request).await
    }

    async fn submit_site_preparation(&self, request: &GatewayRequest) -> GatewayResult {
        self.send(EntityType::SitePreparation, request).await
    }

    async fn submit_emptying_service(&self, request: &GatewayRequest) -> GatewayResult {
        self.send(EntityType::EmptyingService, request).await
    }

    async fn submit_building_survey(&self, request: &GatewayRequest) -> GatewayResult {
        self.send(EntityType::BuildingSurvey, request).await
    }
}
