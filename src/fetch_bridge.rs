//! Fetch bridge: typed messages between the page context and the privileged
//! background context.
//!
//! Architecture:
//! ```text
//! Page:        BridgeClient::call(FETCH_IMAGE { url, referer })
//!      ↓       mpsc envelope + oneshot reply, per-call timeout
//! Background:  CrossOriginFetcher::fetch(url, referer)   (no credentials)
//!      ↓       FETCH_IMAGE_OFFSCREEN / PROCESS_IMAGE_DATA also go through
//! Relay:       RelayHost::reencode(data_uri) → PNG
//!      ↓
//! Page:        { success: true, dataUrl, size }
//! ```
//!
//! The wire shape matches the JSON the messages would take between browser
//! contexts, so the enum doubles as documentation of the protocol.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, warn};

use crate::fetch::CrossOriginFetcher;
use crate::payload::ImagePayload;
use crate::relay::RelayHost;

/// Default bound on a single bridge round trip.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(60);

const QUEUE_DEPTH: usize = 32;

/// Requests the page context may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeRequest {
    /// Fetch raw bytes without the page's credentials.
    FetchImage {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        referer: Option<String>,
    },
    /// Fetch (with variant fallback) and re-encode through the relay.
    FetchImageOffscreen {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        referer: Option<String>,
    },
    /// Re-encode an existing `data:` URI through the relay.
    ProcessImageData {
        #[serde(rename = "dataUrl")]
        data_url: String,
    },
}

impl BridgeRequest {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FetchImage { .. } => "FETCH_IMAGE",
            Self::FetchImageOffscreen { .. } => "FETCH_IMAGE_OFFSCREEN",
            Self::ProcessImageData { .. } => "PROCESS_IMAGE_DATA",
        }
    }
}

/// Reply to any [`BridgeRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BridgeResponse {
    #[must_use]
    pub fn ok(payload: &ImagePayload) -> Self {
        Self {
            success: true,
            data_url: Some(payload.as_str().to_string()),
            size: Some(payload.len()),
            error: None,
        }
    }

    #[must_use]
    pub fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            data_url: None,
            size: None,
            error: Some(error.to_string()),
        }
    }

    /// The payload of a successful reply.
    #[must_use]
    pub fn payload(&self) -> Option<ImagePayload> {
        if !self.success {
            return None;
        }
        self.data_url
            .as_deref()
            .and_then(|uri| ImagePayload::parse(uri).ok())
    }
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("background context is gone")]
    Disconnected,

    #[error("{kind} timed out after {secs}s")]
    Timeout { kind: &'static str, secs: u64 },
}

/// Anything that can carry bridge requests to a privileged context.
#[async_trait]
pub trait PrivilegedChannel: Send + Sync {
    async fn call(&self, request: BridgeRequest) -> Result<BridgeResponse, BridgeError>;
}

/// Privileged side: holds the fetcher and the relay.
pub struct Background {
    fetcher: CrossOriginFetcher,
    relay: Arc<RelayHost>,
}

impl Background {
    #[must_use]
    pub fn new(fetcher: CrossOriginFetcher, relay: Arc<RelayHost>) -> Self {
        Self { fetcher, relay }
    }

    /// Handle one request. Failures become `success: false` replies.
    #[instrument(skip(self, request), fields(kind = request.kind()))]
    pub async fn handle(&self, request: BridgeRequest) -> BridgeResponse {
        match request {
            BridgeRequest::FetchImage { url, referer } => {
                match self.fetcher.fetch(&url, referer.as_deref()).await {
                    Ok(bytes) if bytes.is_empty() => BridgeResponse::failed("empty response body"),
                    Ok(bytes) => BridgeResponse::ok(&ImagePayload::sniffed(&bytes)),
                    Err(e) => BridgeResponse::failed(e),
                }
            }
            BridgeRequest::FetchImageOffscreen { url, referer } => {
                let bytes = match self.fetcher.fetch_with_fallback(&url, referer.as_deref()).await {
                    Ok(bytes) => bytes,
                    Err(e) => return BridgeResponse::failed(e),
                };
                self.reencode(ImagePayload::sniffed(&bytes).as_str()).await
            }
            BridgeRequest::ProcessImageData { data_url } => self.reencode(&data_url).await,
        }
    }

    async fn reencode(&self, data_url: &str) -> BridgeResponse {
        match self.relay.reencode(data_url).await {
            Ok(out) => {
                debug!(size = %out.size, "Relay re-encoded image");
                BridgeResponse::ok(&out.payload)
            }
            Err(e) => BridgeResponse::failed(e),
        }
    }

    /// Start serving requests on a background task.
    #[must_use]
    pub fn spawn(self: Arc<Self>) -> BridgeClient {
        let (tx, mut rx) = mpsc::channel::<Envelope>(QUEUE_DEPTH);
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let background = Arc::clone(&self);
                // Each message is answered independently, like a message listener.
                tokio::spawn(async move {
                    let response = background.handle(envelope.request).await;
                    let _ = envelope.reply.send(response);
                });
            }
        });
        BridgeClient {
            tx,
            timeout: CALL_TIMEOUT,
        }
    }
}

struct Envelope {
    request: BridgeRequest,
    reply: oneshot::Sender<BridgeResponse>,
}

/// Page-side end of the bridge.
#[derive(Clone)]
pub struct BridgeClient {
    tx: mpsc::Sender<Envelope>,
    timeout: Duration,
}

impl BridgeClient {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl PrivilegedChannel for BridgeClient {
    async fn call(&self, request: BridgeRequest) -> Result<BridgeResponse, BridgeError> {
        let kind = request.kind();
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope { request, reply })
            .await
            .map_err(|_| BridgeError::Disconnected)?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(BridgeError::Disconnected),
            Err(_) => {
                warn!(kind, "Bridge call timed out");
                Err(BridgeError::Timeout {
                    kind,
                    secs: self.timeout.as_secs(),
                })
            }
        }
    }
}
