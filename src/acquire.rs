//! Image acquisition: turn a page image into an OCR-ready PNG payload.
//!
//! Acquisition runs an ordered list of strategies and returns the first
//! payload produced:
//!
//! | Source            | Order                                              |
//! |-------------------|----------------------------------------------------|
//! | ordinary host     | direct draw → privileged fetch + relay             |
//! | pixiv asset (CDN) | offscreen fetch (with fallback) → direct draw      |
//!
//! pixiv's CDN always taints the page surface, so a direct draw there is
//! only a last resort. Each strategy failure is logged and absorbed; the
//! caller sees `None` only once every strategy is exhausted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::fetch::is_hostile_asset;
use crate::fetch_bridge::{BridgeError, BridgeRequest, BridgeResponse, PrivilegedChannel};
use crate::page::{Dimensions, DrawError, ImageElement};
use crate::payload::ImagePayload;
use crate::session::NavigationEpoch;

/// Bound on any single draw or decode step.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum AcquireError {
    #[error("image has no source")]
    NoSource,

    #[error("image is {0}, below the size floor")]
    Undersized(Dimensions),

    #[error("draw failed: {0}")]
    Draw(#[from] DrawError),

    #[error("bridge failed: {0}")]
    Bridge(#[from] BridgeError),

    #[error("background refused: {0}")]
    Rejected(String),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("page is navigating away")]
    Cancelled,

    #[error("every acquisition strategy failed")]
    Exhausted,
}

/// What a strategy gets to work with.
struct Target<'a> {
    image: &'a dyn ImageElement,
    source: &'a str,
    page_url: &'a str,
}

#[async_trait]
trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn attempt(&self, target: &Target<'_>) -> Result<ImagePayload, AcquireError>;
}

/// Draw the live element on a local surface.
struct DirectDraw {
    timeout: Duration,
}

#[async_trait]
impl Strategy for DirectDraw {
    fn name(&self) -> &'static str {
        "direct-draw"
    }

    async fn attempt(&self, target: &Target<'_>) -> Result<ImagePayload, AcquireError> {
        tokio::time::timeout(self.timeout, target.image.draw())
            .await
            .map_err(|_| AcquireError::Timeout("direct draw"))?
            .map_err(AcquireError::from)
    }
}

/// Fetch raw bytes through the background, then re-encode in the relay.
struct FetchThenRelay {
    channel: Arc<dyn PrivilegedChannel>,
}

#[async_trait]
impl Strategy for FetchThenRelay {
    fn name(&self) -> &'static str {
        "fetch+relay"
    }

    async fn attempt(&self, target: &Target<'_>) -> Result<ImagePayload, AcquireError> {
        let raw = self
            .channel
            .call(BridgeRequest::FetchImage {
                url: target.source.to_string(),
                referer: Some(target.page_url.to_string()),
            })
            .await?;
        let raw = expect_payload(&raw)?;

        let reencoded = self
            .channel
            .call(BridgeRequest::ProcessImageData {
                data_url: raw.as_str().to_string(),
            })
            .await?;
        expect_payload(&reencoded)
    }
}

/// Fetch with variant fallback and re-encode, all on the privileged side.
struct OffscreenFetch {
    channel: Arc<dyn PrivilegedChannel>,
}

#[async_trait]
impl Strategy for OffscreenFetch {
    fn name(&self) -> &'static str {
        "offscreen-fetch"
    }

    async fn attempt(&self, target: &Target<'_>) -> Result<ImagePayload, AcquireError> {
        let response = self
            .channel
            .call(BridgeRequest::FetchImageOffscreen {
                url: target.source.to_string(),
                referer: Some(target.page_url.to_string()),
            })
            .await?;
        expect_payload(&response)
    }
}

fn expect_payload(response: &BridgeResponse) -> Result<ImagePayload, AcquireError> {
    response.payload().ok_or_else(|| {
        AcquireError::Rejected(
            response
                .error
                .clone()
                .unwrap_or_else(|| "no image data".to_string()),
        )
    })
}

/// Produces OCR-ready payloads from page images.
pub struct ImageAcquirer {
    direct: DirectDraw,
    fetch_relay: FetchThenRelay,
    offscreen: OffscreenFetch,
}

impl ImageAcquirer {
    #[must_use]
    pub fn new(channel: Arc<dyn PrivilegedChannel>) -> Self {
        Self {
            direct: DirectDraw {
                timeout: STEP_TIMEOUT,
            },
            fetch_relay: FetchThenRelay {
                channel: Arc::clone(&channel),
            },
            offscreen: OffscreenFetch { channel },
        }
    }

    #[must_use]
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.direct.timeout = timeout;
        self
    }

    /// Acquire a payload, or `None` if the image is smaller than `floor`,
    /// has no source, or every strategy failed.
    pub async fn acquire(
        &self,
        image: &dyn ImageElement,
        page_url: &str,
        floor: Dimensions,
        epoch: &NavigationEpoch,
    ) -> Option<ImagePayload> {
        match self.try_acquire(image, page_url, floor, epoch).await {
            Ok(payload) => Some(payload),
            Err(e) => {
                debug!(id = image.id(), error = %e, "Acquisition failed");
                None
            }
        }
    }

    /// Like [`ImageAcquirer::acquire`] but reports why nothing was produced.
    pub async fn try_acquire(
        &self,
        image: &dyn ImageElement,
        page_url: &str,
        floor: Dimensions,
        epoch: &NavigationEpoch,
    ) -> Result<ImagePayload, AcquireError> {
        let source = image
            .resolved_original()
            .or_else(|| image.current_src())
            .filter(|s| !s.is_empty())
            .ok_or(AcquireError::NoSource)?;
        let size = image.natural_size();
        if !size.meets(floor) {
            return Err(AcquireError::Undersized(size));
        }

        let target = Target {
            image,
            source: &source,
            page_url,
        };

        for strategy in self.chain_for(&source) {
            if epoch.is_tripped() {
                return Err(AcquireError::Cancelled);
            }
            match strategy.attempt(&target).await {
                Ok(payload) => {
                    info!(
                        id = image.id(),
                        strategy = strategy.name(),
                        bytes = payload.len(),
                        "Image acquired"
                    );
                    return Ok(payload);
                }
                // Cross-origin taint is the expected outcome on most CDNs.
                Err(AcquireError::Draw(DrawError::Tainted)) => {
                    debug!(id = image.id(), "Surface tainted, falling through");
                }
                Err(e) => {
                    warn!(id = image.id(), strategy = strategy.name(), error = %e, "Strategy failed");
                }
            }
        }

        Err(AcquireError::Exhausted)
    }

    fn chain_for(&self, source: &str) -> [&dyn Strategy; 2] {
        if is_hostile_asset(source) {
            [&self.offscreen as &dyn Strategy, &self.direct]
        } else {
            [&self.direct as &dyn Strategy, &self.fetch_relay]
        }
    }
}
