//! Discovery for ordinary pages: any loaded image above the size floor.

use std::time::Duration;

use async_trait::async_trait;

use super::{wait_for_load, DiscoveryProtocol};
use crate::page::{Dimensions, ImageElement};

/// How long to wait for an image that hasn't loaded yet.
pub const LOAD_WAIT: Duration = Duration::from_secs(2);

/// Admits every image whose natural size meets the floor.
///
/// Generic sites are assumed to serve full resolution, so no original URI
/// is recorded.
pub struct GenericProtocol;

#[async_trait]
impl DiscoveryProtocol for GenericProtocol {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn matches(&self, _host: &str) -> bool {
        true
    }

    async fn evaluate(&self, image: &dyn ImageElement, floor: Dimensions) -> bool {
        wait_for_load(image, LOAD_WAIT).await;
        image.natural_size().meets(floor)
    }
}
