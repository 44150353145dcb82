//! Discovery for pixiv pages.
//!
//! pixiv markup references square-cropped or custom-sized thumbnails behind a
//! resize proxy, e.g.
//! `https://i.pximg.net/c/250x250_80_a2/img-master/img/2024/01/01/00/00/00/123_p0_square1200.jpg`.
//! The full-resolution rendition lives at the same path without the proxy
//! segment and with a `_master1200` suffix. This protocol derives that URI
//! and records it on the element so acquisition fetches the good copy.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use super::{wait_for_load, DiscoveryProtocol};
use crate::fetch::is_hostile_asset;
use crate::page::{Dimensions, ImageElement};

/// pixiv images are slower to arrive; wait longer than for generic pages.
pub const LOAD_WAIT: Duration = Duration::from_secs(5);

static RESIZE_PROXY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/c/[^/]+/").unwrap());

static DEGRADED_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"_(?:square|custom)\d+(\.(?:jpe?g|png|gif|webp))(?:\?.*)?$").unwrap()
});

/// Discovery for `pixiv.net` and its subdomains.
pub struct PixivProtocol;

#[async_trait]
impl DiscoveryProtocol for PixivProtocol {
    fn name(&self) -> &'static str {
        "pixiv"
    }

    fn matches(&self, host: &str) -> bool {
        host == "pixiv.net" || host.ends_with(".pixiv.net")
    }

    async fn evaluate(&self, image: &dyn ImageElement, floor: Dimensions) -> bool {
        let canonical = best_candidate(image).map(|c| canonical_uri(&c));

        wait_for_load(image, LOAD_WAIT).await;
        if !image.natural_size().meets(floor) {
            return false;
        }

        if let Some(uri) = canonical {
            tracing::debug!(id = image.id(), uri = %uri, "Resolved pixiv original");
            image.set_resolved_original(uri);
        }
        true
    }
}

/// Highest-resolution asset-domain candidate: the last matching `srcset`
/// entry, else `src` when it points at the asset domain.
fn best_candidate(image: &dyn ImageElement) -> Option<String> {
    let from_srcset = image.srcset().and_then(|srcset| {
        srcset
            .split(',')
            .filter_map(|candidate| candidate.split_whitespace().next())
            .filter(|url| is_hostile_asset(url))
            .last()
            .map(str::to_string)
    });

    from_srcset.or_else(|| image.current_src().filter(|src| is_hostile_asset(src)))
}

/// Strip the resize proxy and swap degraded suffixes for `_master1200`.
#[must_use]
pub fn canonical_uri(uri: &str) -> String {
    let unproxied = RESIZE_PROXY.replace(uri, "/");
    DEGRADED_SUFFIX
        .replace(&unproxied, "_master1200$1")
        .into_owned()
}
