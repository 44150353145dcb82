//! Static-HTML page backed by `scraper`.
//!
//! Loads a document once, exposes every `<img>` as an [`HtmlImage`], and lets
//! a driver replay DOM changes ([`HtmlPage::insert_html`],
//! [`HtmlPage::navigate`], [`HtmlPage::unload`]). Image loading goes through
//! the page's own client and in-page draws follow canvas origin rules: only
//! same-origin and `data:` sources can be read back.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::REFERER;
use reqwest::Client;
use scraper::{Html, Selector};
use thiserror::Error;
use tokio::sync::{broadcast, OnceCell};
use tracing::{debug, instrument};
use url::Url;

use super::{
    next_element_id, Annotation, Dimensions, DrawError, ElementId, ImageElement, ImageRef, Page,
    PageEvent,
};
use crate::fetch::referer_for;
use crate::payload::ImagePayload;

static IMG_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("img").unwrap());

#[derive(Error, Debug)]
pub enum PageError {
    #[error("invalid page URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("failed to load page: {0}")]
    Http(#[from] reqwest::Error),
}

/// A fetched HTML document.
pub struct HtmlPage {
    url: Mutex<Url>,
    client: Client,
    images: Mutex<Vec<Arc<HtmlImage>>>,
    events: broadcast::Sender<PageEvent>,
}

impl HtmlPage {
    /// Fetch and parse a page with the given client.
    #[instrument(skip(client))]
    pub async fn fetch(url: &str, client: Client) -> Result<Arc<Self>, PageError> {
        let parsed = Url::parse(url)?;
        let response = client.get(parsed.clone()).send().await?.error_for_status()?;
        // Redirects move the document; resolve images against where we landed.
        let final_url = response.url().clone();
        let body = response.text().await?;
        debug!(bytes = body.len(), url = %final_url, "Page loaded");
        Ok(Self::parse(final_url, &body, client))
    }

    /// Build a page from markup already in hand.
    #[must_use]
    pub fn parse(url: Url, html: &str, client: Client) -> Arc<Self> {
        let images = extract_images(&url, html, &client);
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            url: Mutex::new(url),
            client,
            images: Mutex::new(images),
            events,
        })
    }

    /// Concrete handles to every image, in document order.
    #[must_use]
    pub fn html_images(&self) -> Vec<Arc<HtmlImage>> {
        lock(&self.images).clone()
    }

    /// Append a fragment to the document and report its images as added nodes.
    pub fn insert_html(&self, fragment: &str) -> Vec<Arc<HtmlImage>> {
        let base = lock(&self.url).clone();
        let added = extract_images(&base, fragment, &self.client);
        lock(&self.images).extend(added.iter().cloned());
        if !added.is_empty() {
            let refs = added.iter().map(|i| Arc::clone(i) as ImageRef).collect();
            self.emit(PageEvent::NodesAdded(refs));
        }
        added
    }

    /// Detach an image from the document.
    pub fn remove(&self, id: ElementId) {
        lock(&self.images).retain(|i| i.id != id);
    }

    /// Client-side route change.
    pub fn navigate(&self, url: &str) -> Result<(), PageError> {
        let next = Url::parse(url)?;
        *lock(&self.url) = next.clone();
        self.emit(PageEvent::UrlChanged(next.into()));
        Ok(())
    }

    pub fn unload(&self) {
        self.emit(PageEvent::Unload);
    }

    pub fn history_navigation(&self) {
        self.emit(PageEvent::HistoryNavigation);
    }

    fn emit(&self, event: PageEvent) {
        // No subscribers simply means nobody is watching yet.
        let _ = self.events.send(event);
    }
}

impl Page for HtmlPage {
    fn url(&self) -> String {
        lock(&self.url).to_string()
    }

    fn images(&self) -> Vec<ImageRef> {
        lock(&self.images)
            .iter()
            .map(|i| Arc::clone(i) as ImageRef)
            .collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<PageEvent> {
        self.events.subscribe()
    }
}

struct LoadedImage {
    bytes: Bytes,
    size: Dimensions,
}

/// One `<img>` from an [`HtmlPage`].
pub struct HtmlImage {
    id: ElementId,
    src: Option<Url>,
    srcset: Option<String>,
    page_url: String,
    page_origin: url::Origin,
    client: Client,
    fetched: OnceCell<Option<LoadedImage>>,
    resolved: Mutex<Option<String>>,
    processing: AtomicBool,
    annotation: Mutex<Option<Annotation>>,
}

impl HtmlImage {
    fn new(page_url: &Url, src: Option<Url>, srcset: Option<String>, client: Client) -> Self {
        Self {
            id: next_element_id(),
            src,
            srcset,
            page_url: page_url.to_string(),
            page_origin: page_url.origin(),
            client,
            fetched: OnceCell::new(),
            resolved: Mutex::new(None),
            processing: AtomicBool::new(false),
            annotation: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn src_url(&self) -> Option<&Url> {
        self.src.as_ref()
    }

    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    fn same_origin(&self) -> bool {
        self.src
            .as_ref()
            .is_some_and(|src| src.scheme() == "data" || src.origin() == self.page_origin)
    }

    async fn load(&self) -> Option<LoadedImage> {
        let src = self.src.as_ref()?;
        let bytes = if src.scheme() == "data" {
            Bytes::from(ImagePayload::parse(src.as_str()).ok()?.to_bytes().ok()?)
        } else {
            match self.fetch(src).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!(src = %src, error = %e, "Image failed to load");
                    return None;
                }
            }
        };

        let size = image::ImageReader::new(Cursor::new(&bytes))
            .with_guessed_format()
            .ok()?
            .into_dimensions()
            .ok()?;
        Some(LoadedImage {
            bytes,
            size: Dimensions::new(size.0, size.1),
        })
    }

    /// Load the way the document would: the page is the referer, except on
    /// hosts that insist on their own.
    async fn fetch(&self, src: &Url) -> reqwest::Result<Bytes> {
        let mut request = self.client.get(src.clone());
        if let Some(referer) = referer_for(src.as_str(), Some(&self.page_url)) {
            request = request.header(REFERER, referer);
        }
        request
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await
    }
}

#[async_trait]
impl ImageElement for HtmlImage {
    fn id(&self) -> ElementId {
        self.id
    }

    fn current_src(&self) -> Option<String> {
        self.src.as_ref().map(ToString::to_string)
    }

    fn srcset(&self) -> Option<String> {
        self.srcset.clone()
    }

    fn natural_size(&self) -> Dimensions {
        self.fetched
            .get()
            .and_then(Option::as_ref)
            .map(|l| l.size)
            .unwrap_or_default()
    }

    fn is_loaded(&self) -> bool {
        self.fetched.initialized()
    }

    async fn loaded(&self) {
        self.fetched.get_or_init(|| self.load()).await;
    }

    async fn draw(&self) -> Result<ImagePayload, DrawError> {
        let loaded = self
            .fetched
            .get()
            .and_then(Option::as_ref)
            .ok_or(DrawError::NotLoaded)?;
        if !self.same_origin() {
            return Err(DrawError::Tainted);
        }

        let bytes = loaded.bytes.clone();
        tokio::task::spawn_blocking(move || encode_png(&bytes))
            .await
            .map_err(|e| DrawError::Encode(e.to_string()))?
    }

    fn resolved_original(&self) -> Option<String> {
        lock(&self.resolved).clone()
    }

    fn set_resolved_original(&self, uri: String) {
        *lock(&self.resolved) = Some(uri);
    }

    fn set_processing(&self, processing: bool) {
        self.processing.store(processing, Ordering::SeqCst);
    }

    fn annotate(&self, annotation: Annotation) {
        *lock(&self.annotation) = Some(annotation);
    }

    fn annotation(&self) -> Option<Annotation> {
        lock(&self.annotation).clone()
    }
}

fn encode_png(bytes: &[u8]) -> Result<ImagePayload, DrawError> {
    let decoded = image::load_from_memory(bytes).map_err(|e| DrawError::Encode(e.to_string()))?;
    let mut png = Vec::new();
    decoded
        .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
        .map_err(|e| DrawError::Encode(e.to_string()))?;
    Ok(ImagePayload::png(&png))
}

fn extract_images(base: &Url, html: &str, client: &Client) -> Vec<Arc<HtmlImage>> {
    let document = Html::parse_document(html);
    document
        .select(&IMG_SELECTOR)
        .map(|element| {
            let attrs = element.value();
            // Lazy loaders park the real source in data-src until scrolled into view.
            let src = attrs
                .attr("src")
                .filter(|s| !s.trim().is_empty())
                .or_else(|| attrs.attr("data-src"))
                .and_then(|s| base.join(s.trim()).ok());
            let srcset = attrs
                .attr("srcset")
                .map(|raw| absolutize_srcset(base, raw))
                .filter(|s| !s.is_empty());
            Arc::new(HtmlImage::new(base, src, srcset, client.clone()))
        })
        .collect()
}

/// Resolve every candidate URL in a `srcset` against the document base.
fn absolutize_srcset(base: &Url, raw: &str) -> String {
    raw.split(',')
        .filter_map(|candidate| {
            let mut parts = candidate.split_whitespace();
            let url = base.join(parts.next()?).ok()?;
            let descriptor: Vec<&str> = parts.collect();
            Some(if descriptor.is_empty() {
                url.to_string()
            } else {
                format!("{url} {}", descriptor.join(" "))
            })
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
