use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::errors::AppError;
use crate::models::ImageJobSettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub url: String,
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, settings: &ImageJobSettings) -> Result<GeneratedImage, AppError>;
}

#[derive(Serialize)]
struct ImageRequest<'a> {
    prompt: String,
    n: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    style: Option<&'a str>,
}

#[derive(Deserialize)]
struct ImageResponse {
    #[serde(default)]
    data: Vec<ImageData>,
}

#[derive(Deserialize)]
struct ImageData {
    url: Option<String>,
}

/// Image provider reached over the OpenAI-style `images/generations` endpoint.
#[derive(Clone)]
pub struct HttpImageGenerator {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpImageGenerator {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl ImageGenerator for HttpImageGenerator {
    async fn generate(&self, settings: &ImageJobSettings) -> Result<GeneratedImage, AppError> {
        let body = ImageRequest {
            prompt: settings.prompt.clone(),
            n: 1,
            style: settings.style.as_deref(),
        };
        let mut req = self
            .client
            .post(format!("{}/images/generations", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(|e| {
            error!("Image provider request failed: {e}");
            AppError::ImageGenerationFailed { message: e.to_string() }
        })?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(AppError::ImageGenerationFailed {
                message: format!("provider returned {status}"),
            });
        }

        let parsed: ImageResponse = response
            .json()
            .await
            .map_err(|e| AppError::ImageGenerationFailed { message: e.to_string() })?;
        let url = parsed
            .data
            .into_iter()
            .find_map(|d| d.url)
            .ok_or_else(|| AppError::ImageGenerationFailed {
                message: "provider returned no image".into(),
            })?;
        debug!("Image generated at {url}");
        Ok(GeneratedImage { url })
    }
}
