//! Client for the local OCR/translation server.
//!
//! `POST /ocr` takes `{ image, target_lang }` and answers with detected text
//! blocks; `GET /health` answers `{ status: "ok" }`. A missing or empty
//! `text_blocks` list is a valid answer meaning "no text in this image".

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::config::DEFAULT_ENDPOINT;
use crate::payload::ImagePayload;

#[derive(Error, Debug)]
pub enum OcrError {
    #[error("OCR server returned HTTP {0}")]
    Status(u16),

    #[error("OCR server unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("OCR call timed out after {0}s")]
    Timeout(u64),
}

/// Axis-aligned rectangle in source-image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl BoundingBox {
    #[must_use]
    pub fn width(&self) -> f64 {
        (self.x1 - self.x0).abs()
    }

    #[must_use]
    pub fn height(&self) -> f64 {
        (self.y1 - self.y0).abs()
    }
}

/// One region of recognized (and possibly translated) text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    /// Text to display: the translation when one succeeded, else the source text.
    pub text: String,
    pub bbox: BoundingBox,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub style: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translated_text: Option<String>,
}

#[derive(Debug, Serialize)]
struct OcrRequest<'a> {
    image: &'a str,
    target_lang: &'a str,
}

/// Body of a `/ocr` reply.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OcrResponse {
    #[serde(default)]
    pub text_blocks: Option<Vec<TextBlock>>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub bubbles_count: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthStatus {
    pub status: String,
}

impl HealthStatus {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Something that turns an image into text blocks.
#[async_trait]
pub trait OcrService: Send + Sync {
    async fn recognize(
        &self,
        image: &ImagePayload,
        target_lang: &str,
    ) -> Result<Vec<TextBlock>, OcrError>;
}

/// HTTP client for the OCR server.
#[derive(Clone)]
pub struct OcrClient {
    client: Client,
    endpoint: String,
}

impl OcrClient {
    pub fn new(endpoint: &str) -> Result<Self, OcrError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self::with_client(client, endpoint))
    }

    #[must_use]
    pub fn with_client(client: Client, endpoint: &str) -> Self {
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// `GET /health`.
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    pub async fn health(&self) -> Result<HealthStatus, OcrError> {
        let response = self
            .client
            .get(format!("{}/health", self.endpoint))
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(OcrError::Status(response.status().as_u16()));
        }
        Ok(response.json().await?)
    }

    /// `POST /ocr`, returning the full reply.
    #[instrument(skip(self, image), fields(bytes = image.len()))]
    pub async fn submit(&self, image: &ImagePayload, target_lang: &str) -> Result<OcrResponse, OcrError> {
        let response = self
            .client
            .post(format!("{}/ocr", self.endpoint))
            .json(&OcrRequest {
                image: image.as_str(),
                target_lang,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            debug!(status = status.as_u16(), "OCR rejected");
            return Err(OcrError::Status(status.as_u16()));
        }

        let body: OcrResponse = response.json().await?;
        info!(
            blocks = body.text_blocks.as_ref().map_or(0, Vec::len),
            "OCR response received"
        );
        Ok(body)
    }
}

impl Default for OcrClient {
    fn default() -> Self {
        Self::with_client(Client::new(), DEFAULT_ENDPOINT)
    }
}

#[async_trait]
impl OcrService for OcrClient {
    async fn recognize(
        &self,
        image: &ImagePayload,
        target_lang: &str,
    ) -> Result<Vec<TextBlock>, OcrError> {
        Ok(self
            .submit(image, target_lang)
            .await?
            .text_blocks
            .unwrap_or_default())
    }
}
