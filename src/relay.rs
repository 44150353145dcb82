//! Canvas relay: an isolated context that decodes image bytes and re-encodes
//! them as PNG.
//!
//! Pixels drawn from a cross-origin source can't be read back in the page
//! that drew them. The relay receives the bytes as a `data:` URI instead, so
//! its surface is never tainted.
//!
//! Architecture:
//! ```text
//! RelayHost::reencode(data_uri)
//!      ↓       ensure(): reuse or create the single context for RELAY_URL
//! RelayHandle  ── mpsc ──▶  relay task: decode (≤ 10s) → PNG
//!      ↑                         │
//!      └──────── oneshot ◀───────┘
//! ```

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::page::Dimensions;
use crate::payload::ImagePayload;

/// Address of the relay document; one context per address.
pub const RELAY_URL: &str = "pageocr://relay/offscreen";

/// Upper bound on a single decode.
pub const DECODE_TIMEOUT: Duration = Duration::from_secs(10);

/// Slack on top of the decode bound for the channel round trip.
const ROUND_TRIP_SLACK: Duration = Duration::from_secs(2);

const QUEUE_DEPTH: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("image decode timed out")]
    DecodeTimeout,

    #[error("image decode failed: {0}")]
    DecodeFailure(String),
}

/// A lossless re-encoding and the size it was drawn at.
#[derive(Debug, Clone)]
pub struct Reencoded {
    pub payload: ImagePayload,
    pub size: Dimensions,
}

/// Turns encoded bytes into a PNG payload.
#[async_trait]
pub trait Decoder: Send + Sync {
    async fn decode(&self, bytes: Vec<u8>) -> Result<Reencoded, RelayError>;
}

/// Decodes with the `image` crate on the blocking pool.
pub struct RasterDecoder;

#[async_trait]
impl Decoder for RasterDecoder {
    async fn decode(&self, bytes: Vec<u8>) -> Result<Reencoded, RelayError> {
        tokio::task::spawn_blocking(move || -> Result<Reencoded, RelayError> {
            let decoded = image::load_from_memory(&bytes)
                .map_err(|e| RelayError::DecodeFailure(e.to_string()))?;
            // Surface sized to the natural dimensions: the decoded buffer itself.
            let size = Dimensions::new(decoded.width(), decoded.height());
            let mut png = Vec::new();
            decoded
                .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
                .map_err(|e| RelayError::DecodeFailure(e.to_string()))?;
            Ok(Reencoded {
                payload: ImagePayload::png(&png),
                size,
            })
        })
        .await
        .map_err(|e| RelayError::DecodeFailure(e.to_string()))?
    }
}

struct RelayJob {
    data_uri: String,
    reply: oneshot::Sender<Result<Reencoded, RelayError>>,
}

/// Sending side of a running relay context.
#[derive(Clone)]
pub struct RelayHandle {
    url: Arc<str>,
    tx: mpsc::Sender<RelayJob>,
    decode_timeout: Duration,
}

impl RelayHandle {
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Re-encode a `data:` URI inside the relay context.
    pub async fn reencode(&self, data_uri: &str) -> Result<Reencoded, RelayError> {
        let (reply, rx) = oneshot::channel();
        let job = RelayJob {
            data_uri: data_uri.to_string(),
            reply,
        };
        self.tx
            .send(job)
            .await
            .map_err(|_| RelayError::DecodeFailure("relay context closed".into()))?;

        match tokio::time::timeout(self.decode_timeout + ROUND_TRIP_SLACK, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RelayError::DecodeFailure("relay dropped the request".into())),
            Err(_) => Err(RelayError::DecodeTimeout),
        }
    }
}

/// Owns the single relay context and creates it on first use.
pub struct RelayHost {
    url: String,
    decoder: Arc<dyn Decoder>,
    decode_timeout: Duration,
    slot: Mutex<Option<RelayHandle>>,
    created: AtomicUsize,
}

impl RelayHost {
    #[must_use]
    pub fn new(decoder: Arc<dyn Decoder>) -> Self {
        Self {
            url: RELAY_URL.to_string(),
            decoder,
            decode_timeout: DECODE_TIMEOUT,
            slot: Mutex::new(None),
            created: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn with_decode_timeout(mut self, timeout: Duration) -> Self {
        self.decode_timeout = timeout;
        self
    }

    /// Number of contexts created so far.
    #[must_use]
    pub fn contexts_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Return the live context, creating it if none exists.
    ///
    /// Concurrent callers queue on the slot lock, so they all receive the
    /// context built by whichever caller got there first.
    pub async fn ensure(&self) -> RelayHandle {
        let mut slot = self.slot.lock().await;
        if let Some(existing) = slot
            .as_ref()
            .filter(|h| h.url() == self.url && !h.is_closed())
        {
            return existing.clone();
        }

        let handle = self.create();
        *slot = Some(handle.clone());
        handle
    }

    /// Re-encode through the (possibly newly created) relay context.
    pub async fn reencode(&self, data_uri: &str) -> Result<Reencoded, RelayError> {
        self.ensure().await.reencode(data_uri).await
    }

    fn create(&self) -> RelayHandle {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let timeout = self.decode_timeout;
        tokio::spawn(run_context(rx, Arc::clone(&self.decoder), timeout));

        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        info!(url = %self.url, contexts = n, "Relay context created");

        RelayHandle {
            url: self.url.as_str().into(),
            tx,
            decode_timeout: timeout,
        }
    }
}

async fn run_context(
    mut rx: mpsc::Receiver<RelayJob>,
    decoder: Arc<dyn Decoder>,
    decode_timeout: Duration,
) {
    while let Some(job) = rx.recv().await {
        let decoder = Arc::clone(&decoder);
        tokio::spawn(async move {
            let result = decode_bounded(decoder.as_ref(), &job.data_uri, decode_timeout).await;
            // The requester may have given up; its result slot is already settled.
            if job.reply.send(result).is_err() {
                debug!("Relay reply dropped by requester");
            }
        });
    }
    debug!("Relay context closed");
}

async fn decode_bounded(
    decoder: &dyn Decoder,
    data_uri: &str,
    decode_timeout: Duration,
) -> Result<Reencoded, RelayError> {
    let bytes = ImagePayload::parse(data_uri)
        .and_then(|p| p.to_bytes())
        .map_err(|e| RelayError::DecodeFailure(e.to_string()))?;
    if bytes.is_empty() {
        return Err(RelayError::DecodeFailure("empty image".into()));
    }

    // Dropping the decode future on expiry cancels it, so nothing from it
    // can land after the timeout result is returned.
    match tokio::time::timeout(decode_timeout, decoder.decode(bytes)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(timeout_secs = decode_timeout.as_secs(), "Relay decode timed out");
            Err(RelayError::DecodeTimeout)
        }
    }
}
