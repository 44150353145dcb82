//! Page abstraction: image elements, their annotations, and DOM change events.
//!
//! The page owns its image elements. The pipeline only keeps element ids and
//! [`std::sync::Weak`] references, so an element removed from the page is
//! simply skipped when its turn in the queue comes.
//!
//! # Architecture
//!
//! - [`ImageElement`]: one `<img>` with its load state and annotations
//! - [`Page`]: the document; enumerates images and publishes [`PageEvent`]s
//! - [`html::HtmlPage`]: a static-HTML implementation backed by `scraper`

pub mod html;

#[cfg(test)]
pub(crate) mod fake;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::payload::ImagePayload;

/// Identity of an image element within one process.
pub type ElementId = u64;

static NEXT_ELEMENT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh element id.
#[must_use]
pub fn next_element_id() -> ElementId {
    NEXT_ELEMENT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Natural pixel dimensions of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Both sides reach the floor.
    #[must_use]
    pub fn meets(&self, floor: Dimensions) -> bool {
        self.width >= floor.width && self.height >= floor.height
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Why an in-page draw did not yield pixels.
#[derive(Error, Debug)]
pub enum DrawError {
    /// A cross-origin source taints the surface; reading it back is refused.
    #[error("surface tainted by cross-origin source")]
    Tainted,

    #[error("image has not finished loading")]
    NotLoaded,

    #[error("failed to encode surface: {0}")]
    Encode(String),
}

/// Which payload an annotated image currently displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleState {
    Original,
    Translated,
}

/// Payload references written onto an image once it has been overlaid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub original: ImagePayload,
    pub translated: ImagePayload,
    pub state: ToggleState,
}

impl Annotation {
    #[must_use]
    pub fn translated(original: ImagePayload, translated: ImagePayload) -> Self {
        Self {
            original,
            translated,
            state: ToggleState::Translated,
        }
    }

    /// Payload currently on display.
    #[must_use]
    pub fn displayed(&self) -> &ImagePayload {
        match self.state {
            ToggleState::Original => &self.original,
            ToggleState::Translated => &self.translated,
        }
    }

    /// Flip between original and translated.
    #[must_use]
    pub fn toggled(mut self) -> Self {
        self.state = match self.state {
            ToggleState::Original => ToggleState::Translated,
            ToggleState::Translated => ToggleState::Original,
        };
        self
    }
}

/// One image element on a page.
#[async_trait]
pub trait ImageElement: Send + Sync {
    fn id(&self) -> ElementId;

    /// Current display source (`src`), if any.
    fn current_src(&self) -> Option<String>;

    /// Raw `srcset` attribute, if any.
    fn srcset(&self) -> Option<String>;

    /// Natural size; zero until the image has loaded.
    fn natural_size(&self) -> Dimensions;

    fn is_loaded(&self) -> bool;

    /// Resolves once the image has loaded (or failed to). May never resolve;
    /// callers bound it with a timeout.
    async fn loaded(&self);

    /// Draw onto a local surface and read it back as PNG.
    async fn draw(&self) -> Result<ImagePayload, DrawError>;

    /// Higher-resolution canonical source recorded during discovery.
    fn resolved_original(&self) -> Option<String>;

    fn set_resolved_original(&self, uri: String);

    /// Mark or unmark the element as being worked on.
    fn set_processing(&self, processing: bool);

    fn annotate(&self, annotation: Annotation);

    fn annotation(&self) -> Option<Annotation>;

    /// Swap the displayed payload; no-op on an unannotated element.
    fn toggle(&self) {
        if let Some(annotation) = self.annotation() {
            self.annotate(annotation.toggled());
        }
    }
}

/// Shared handle to a page-owned element.
pub type ImageRef = Arc<dyn ImageElement>;

/// DOM changes reported by a page.
#[derive(Clone)]
pub enum PageEvent {
    /// Nodes were inserted; carries every image in the inserted subtrees.
    NodesAdded(Vec<ImageRef>),
    /// `src` or `srcset` changed on an existing image.
    SourceChanged(ImageRef),
    /// The document URL changed without a reload.
    UrlChanged(String),
    /// The page is being unloaded.
    Unload,
    /// Back/forward navigation.
    HistoryNavigation,
}

impl fmt::Debug for PageEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodesAdded(images) => f
                .debug_tuple("NodesAdded")
                .field(&images.iter().map(|i| i.id()).collect::<Vec<_>>())
                .finish(),
            Self::SourceChanged(image) => f.debug_tuple("SourceChanged").field(&image.id()).finish(),
            Self::UrlChanged(url) => f.debug_tuple("UrlChanged").field(url).finish(),
            Self::Unload => f.write_str("Unload"),
            Self::HistoryNavigation => f.write_str("HistoryNavigation"),
        }
    }
}

/// A document hosting image elements.
pub trait Page: Send + Sync {
    /// Current document URL.
    fn url(&self) -> String;

    /// Host of the current URL, lowercased.
    fn host(&self) -> Option<String> {
        url::Url::parse(&self.url())
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
    }

    /// Every image currently in the document, in document order.
    fn images(&self) -> Vec<ImageRef>;

    /// Subscribe to DOM change events.
    fn subscribe(&self) -> broadcast::Receiver<PageEvent>;
}
