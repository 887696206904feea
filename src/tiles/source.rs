//! Where tile imagery comes from.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::errors::AppError;
use crate::models::TileKey;

const USER_AGENT: &str = concat!("field-sync-core/", env!("CARGO_PKG_VERSION"));

/// Remote source of raster tiles.
#[async_trait]
pub trait TileSource: Send + Sync {
    async fn fetch_tile(&self, key: &TileKey) -> Result<Vec<u8>, AppError>;
}

/// Tile server addressed by a URL template such as
/// `https://tiles.example.org/{layer}/{z}/{x}/{y}.png`.
#[derive(Clone)]
pub struct HttpTileSource {
    client: Client,
    url_template: String,
}

impl HttpTileSource {
    pub fn new(url_template: impl Into<String>, timeout: Duration) -> Result<Self, AppError> {
        let url_template = url_template.into();
        if !["{z}", "{x}", "{y}"].iter().all(|p| url_template.contains(p)) {
            return Err(AppError::Validation(format!(
                "Tile URL template must contain {{z}}, {{x}} and {{y}}: {}",
                url_template
            )));
        }

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url_template,
        })
    }

    pub fn url_for(&self, key: &TileKey) -> String {
        self.url_template
            .replace("{z}", &key.zoom.to_string())
            .replace("{x}", &key.x.to_string())
            .replace("{y}", &key.y.to_string())
            .replace("{layer}", key.layer.as_str())
    }
}

#[async_trait]
impl TileSource for HttpTileSource {
    async fn fetch_tile(&self, key: &TileKey) -> Result<Vec<u8>, AppError> {
        let url = self.url_for(key);
        let response = self.client.get(&url).send().await?;
        let status = response.status();

        if !status.is_success() {
            return Err(AppError::Remote {
                status: Some(status.as_u16()),
                code: None,
                message: format!("Tile server returned {} for {}", status, key),
            });
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(AppError::Remote {
                status: Some(status.as_u16()),
                code: None,
                message: format!("Tile server returned an empty body for {}", key),
            });
        }

        Ok(bytes.to_vec())
    }
}
