//! Privileged cross-origin image fetches.
//!
//! Features:
//! - No credentials: no cookie store, no forwarded cookies
//! - Referer chosen per target (pixiv's image CDN insists on its own site)
//! - Variant fallback for pixiv master images whose lossy rendition is missing
//! - No caching; every call goes to the network

use std::sync::LazyLock;
use std::time::Duration;

use bytes::Bytes;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, REFERER};
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Asset domain of the hostile host.
pub const HOSTILE_ASSET_DOMAIN: &str = "pximg.net";

/// Referer the hostile host validates against.
pub const HOSTILE_REFERER: &str = "https://www.pixiv.net/";

/// Path segment of lossy re-encoded renditions.
const LOSSY_SEGMENT: &str = "/img-master/";

/// Path segment of untouched originals.
const CANONICAL_SEGMENT: &str = "/img-original/";

/// Alternate original extensions, tried in this order.
const FALLBACK_EXTENSIONS: [&str; 2] = ["jpg", "png"];

static MASTER_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_master\d+\.(?:jpe?g|png|gif|webp)$").unwrap());

const USER_AGENT: &str = concat!("pageocr/", env!("CARGO_PKG_VERSION"));

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP status {0}")]
    HttpStatus(u16),

    #[error("network failure: {0}")]
    Network(#[from] reqwest::Error),

    #[error("no variant of {url} returned image bytes ({attempts} attempts)")]
    Exhausted { url: String, attempts: usize },
}

/// Fetches image bytes on behalf of a page that cannot read them itself.
#[derive(Clone)]
pub struct CrossOriginFetcher {
    client: Client,
}

impl CrossOriginFetcher {
    /// Create a fetcher with its own credential-less client.
    pub fn new() -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("image/avif,image/webp,image/*,*/*;q=0.8"));

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            // Let the server negotiate; image CDNs are a mix of h1 and h2
            .http2_adaptive_window(true)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .use_rustls_tls()
            .brotli(true)
            .zstd(true)
            .gzip(true)
            .deflate(true)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::limited(10))
            // Credentials are never sent: no cookie store, no cookie header
            .build()?;

        Ok(Self { client })
    }

    /// Wrap an existing client. The caller is responsible for it carrying no
    /// cookie store.
    #[must_use]
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Fetch `url` once, sending the referer appropriate to the target.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn fetch(&self, url: &str, referer: Option<&str>) -> Result<Bytes, FetchError> {
        let mut request = self.client.get(url);
        if let Some(referer) = referer_for(url, referer) {
            request = request.header(REFERER, referer);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            debug!(status = status.as_u16(), "Fetch rejected");
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let body = response.bytes().await?;
        debug!(bytes = body.len(), "Fetched");
        Ok(body)
    }

    /// Fetch `url`, falling back to the original-quality variants when a
    /// lossy master rendition yields nothing.
    ///
    /// Non-master URLs get exactly one attempt.
    pub async fn fetch_with_fallback(
        &self,
        url: &str,
        referer: Option<&str>,
    ) -> Result<Bytes, FetchError> {
        let Some(variants) = fallback_variants(url) else {
            return self.fetch(url, referer).await;
        };

        let mut attempts = 0;
        for candidate in std::iter::once(url.to_string()).chain(variants) {
            attempts += 1;
            match self.fetch(&candidate, referer).await {
                Ok(bytes) if !bytes.is_empty() => {
                    if attempts > 1 {
                        info!(url = %candidate, "Fallback variant succeeded");
                    }
                    return Ok(bytes);
                }
                Ok(_) => debug!(url = %candidate, "Empty body, trying next variant"),
                Err(e) => debug!(url = %candidate, error = %e, "Variant failed"),
            }
        }

        warn!(url = %url, attempts, "All variants failed");
        Err(FetchError::Exhausted {
            url: url.to_string(),
            attempts,
        })
    }
}

/// True when `url` points at the hostile host's asset domain.
#[must_use]
pub fn is_hostile_asset(url: &str) -> bool {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        .is_some_and(|host| {
            host == HOSTILE_ASSET_DOMAIN || host.ends_with(&format!(".{HOSTILE_ASSET_DOMAIN}"))
        })
}

/// Referer to send for `url`: the fixed value for the hostile host, the
/// calling page otherwise.
#[must_use]
pub fn referer_for(url: &str, page_referer: Option<&str>) -> Option<String> {
    if is_hostile_asset(url) {
        Some(HOSTILE_REFERER.to_string())
    } else {
        page_referer.map(str::to_string)
    }
}

/// Original-quality siblings of a lossy master URL, in fetch order.
///
/// `.../img-master/img/.../123_p0_master1200.jpg` becomes
/// `.../img-original/img/.../123_p0.jpg` then `....png`.
#[must_use]
pub fn fallback_variants(url: &str) -> Option<[String; 2]> {
    if !url.contains(LOSSY_SEGMENT) {
        return None;
    }
    let canonical = url.replacen(LOSSY_SEGMENT, CANONICAL_SEGMENT, 1);
    let stem = MASTER_SUFFIX.replace(&canonical, "");
    if stem == canonical {
        // Not a recognizable master filename; nothing to swap.
        return None;
    }
    Some(FALLBACK_EXTENSIONS.map(|ext| format!("{stem}.{ext}")))
}
