//! `pageocr` - find images on web pages, get their pixels past cross-origin
//! rules, and overlay OCR/translation results.
//!
//! # Pipeline
//!
//! - **Discovery**: [`site`] protocols decide which images qualify; pixiv gets
//!   its full-resolution originals resolved
//! - **Acquisition**: [`acquire`] tries a direct draw, then a privileged fetch
//!   through the [`fetch_bridge`] with re-encoding in the [`relay`]
//! - **Recognition**: [`ocr`] talks to the local OCR/translation server
//! - **Overlay**: [`overlay`] renders the result, attached to the element as
//!   a toggleable [`page::Annotation`]
//!
//! One [`session::Session`] per page drains a FIFO queue with a single worker.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use pageocr::{
//!     Background, BoxOverlay, CrossOriginFetcher, HtmlPage, ImageAcquirer, OcrClient,
//!     ProtocolRouter, RasterDecoder, RelayHost, Session, SessionDeps, Settings, SettingsStore,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = SettingsStore::new(Settings::load()?);
//!     let settings = store.current();
//!
//!     let relay = Arc::new(RelayHost::new(Arc::new(RasterDecoder)));
//!     let bridge = Arc::new(Background::new(CrossOriginFetcher::new()?, relay)).spawn();
//!     let deps = SessionDeps {
//!         acquirer: Arc::new(ImageAcquirer::new(Arc::new(bridge))),
//!         ocr: Arc::new(OcrClient::new(&settings.endpoint)?),
//!         overlay: Arc::new(BoxOverlay::default()),
//!         settings: store.subscribe(),
//!     };
//!
//!     let page = HtmlPage::fetch("https://example.com/comic/1", reqwest::Client::new()).await?;
//!     let session = Session::start(page, deps, &ProtocolRouter::new()).await;
//!     session.wait_idle().await;
//!     println!("{:?}", session.stats());
//!     Ok(())
//! }
//! ```

pub mod acquire;
pub mod config;
pub mod controller;
pub mod fetch;
pub mod fetch_bridge;
pub mod ocr;
pub mod overlay;
pub mod page;
pub mod payload;
pub mod relay;
pub mod session;
pub mod site;

#[cfg(test)]
mod testutil;

pub use acquire::{AcquireError, ImageAcquirer};
pub use config::{config_path, ConfigError, Settings, SettingsStore};
pub use controller::Controller;
pub use fetch::{CrossOriginFetcher, FetchError};
pub use fetch_bridge::{Background, BridgeClient, BridgeRequest, BridgeResponse, PrivilegedChannel};
pub use ocr::{OcrClient, OcrError, OcrService, TextBlock};
pub use overlay::{BoxOverlay, Overlay};
pub use page::html::{HtmlImage, HtmlPage};
pub use page::{Annotation, Dimensions, ImageElement, Page, PageEvent, ToggleState};
pub use payload::ImagePayload;
pub use relay::{RasterDecoder, RelayHost};
pub use session::{ItemOutcome, NavigationEpoch, Session, SessionDeps, SessionStats};
pub use site::ProtocolRouter;

/// Version of pageocr
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
