//! Site-specific image discovery.
//!
//! Decides which images on a page are worth sending to OCR. Most sites are
//! handled by [`generic::GenericProtocol`]; pixiv serves degraded thumbnails
//! in markup and needs [`pixiv::PixivProtocol`] to find the full-resolution
//! source.
//!
//! # Architecture
//!
//! - [`DiscoveryProtocol`]: evaluates one image for admission
//! - [`ProtocolRouter`]: picks a protocol by page hostname, once per session

pub mod generic;
pub mod pixiv;

use std::sync::Arc;

use async_trait::async_trait;

use crate::page::{Dimensions, ImageElement};

/// Evaluates images for admission into the processing queue.
#[async_trait]
pub trait DiscoveryProtocol: Send + Sync {
    /// Protocol name (e.g., "generic", "pixiv").
    fn name(&self) -> &'static str;

    /// Check if this protocol handles pages on the given host.
    fn matches(&self, host: &str) -> bool;

    /// Wait for the image as long as the protocol allows and decide whether
    /// it is content worth processing. May record a resolved original URI
    /// on the element.
    async fn evaluate(&self, image: &dyn ImageElement, floor: Dimensions) -> bool;
}

/// Routes page hosts to discovery protocols.
///
/// Protocols are checked in registration order. First match wins; the
/// generic protocol is used when none match.
pub struct ProtocolRouter {
    protocols: Vec<Arc<dyn DiscoveryProtocol>>,
    fallback: Arc<dyn DiscoveryProtocol>,
}

impl ProtocolRouter {
    /// Create a router with all site-specific protocols.
    #[must_use]
    pub fn new() -> Self {
        let protocols: Vec<Arc<dyn DiscoveryProtocol>> = vec![Arc::new(pixiv::PixivProtocol)];
        Self {
            protocols,
            fallback: Arc::new(generic::GenericProtocol),
        }
    }

    /// Pick the protocol for a page host.
    #[must_use]
    pub fn select(&self, host: Option<&str>) -> Arc<dyn DiscoveryProtocol> {
        let Some(host) = host else {
            return Arc::clone(&self.fallback);
        };
        for protocol in &self.protocols {
            if protocol.matches(host) {
                tracing::debug!("Matched discovery protocol: {}", protocol.name());
                return Arc::clone(protocol);
            }
        }
        Arc::clone(&self.fallback)
    }
}

impl Default for ProtocolRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for `image` to load, giving up after `limit`.
pub(crate) async fn wait_for_load(image: &dyn ImageElement, limit: std::time::Duration) {
    if image.is_loaded() {
        return;
    }
    if tokio::time::timeout(limit, image.loaded()).await.is_err() {
        tracing::debug!(id = image.id(), "Image did not load in time");
    }
}
