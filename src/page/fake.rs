//! In-memory page used by unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, Notify};

use super::{
    next_element_id, Annotation, Dimensions, DrawError, ElementId, ImageElement, ImageRef, Page,
    PageEvent,
};
use crate::payload::ImagePayload;

pub(crate) struct FakeImage {
    id: ElementId,
    src: Option<String>,
    srcset: Option<String>,
    size: Dimensions,
    loaded: AtomicBool,
    load_signal: Notify,
    tainted: bool,
    pub(crate) draws: AtomicUsize,
    pub(crate) processing: AtomicBool,
    resolved: Mutex<Option<String>>,
    annotation: Mutex<Option<Annotation>>,
}

impl FakeImage {
    pub(crate) fn new(src: &str, width: u32, height: u32) -> Self {
        Self {
            id: next_element_id(),
            src: Some(src.to_string()),
            srcset: None,
            size: Dimensions::new(width, height),
            loaded: AtomicBool::new(true),
            load_signal: Notify::new(),
            tainted: false,
            draws: AtomicUsize::new(0),
            processing: AtomicBool::new(false),
            resolved: Mutex::new(None),
            annotation: Mutex::new(None),
        }
    }

    pub(crate) fn with_srcset(mut self, srcset: &str) -> Self {
        self.srcset = Some(srcset.to_string());
        self
    }

    pub(crate) fn tainted(mut self) -> Self {
        self.tainted = true;
        self
    }

    /// Starts unloaded; call [`FakeImage::finish_loading`] to complete.
    pub(crate) fn pending(self) -> Self {
        self.loaded.store(false, Ordering::SeqCst);
        self
    }

    pub(crate) fn finish_loading(&self) {
        self.loaded.store(true, Ordering::SeqCst);
        self.load_signal.notify_waiters();
    }

    pub(crate) fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Payload a successful draw returns for this element.
    pub(crate) fn drawn_payload(&self) -> ImagePayload {
        ImagePayload::png(format!("drawn-{}", self.id).as_bytes())
    }
}

#[async_trait]
impl ImageElement for FakeImage {
    fn id(&self) -> ElementId {
        self.id
    }

    fn current_src(&self) -> Option<String> {
        self.src.clone()
    }

    fn srcset(&self) -> Option<String> {
        self.srcset.clone()
    }

    fn natural_size(&self) -> Dimensions {
        if self.is_loaded() {
            self.size
        } else {
            Dimensions::default()
        }
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    async fn loaded(&self) {
        while !self.is_loaded() {
            let notified = self.load_signal.notified();
            if self.is_loaded() {
                break;
            }
            notified.await;
        }
    }

    async fn draw(&self) -> Result<ImagePayload, DrawError> {
        self.draws.fetch_add(1, Ordering::SeqCst);
        if self.tainted {
            Err(DrawError::Tainted)
        } else {
            Ok(self.drawn_payload())
        }
    }

    fn resolved_original(&self) -> Option<String> {
        self.resolved.lock().unwrap().clone()
    }

    fn set_resolved_original(&self, uri: String) {
        *self.resolved.lock().unwrap() = Some(uri);
    }

    fn set_processing(&self, processing: bool) {
        self.processing.store(processing, Ordering::SeqCst);
    }

    fn annotate(&self, annotation: Annotation) {
        *self.annotation.lock().unwrap() = Some(annotation);
    }

    fn annotation(&self) -> Option<Annotation> {
        self.annotation.lock().unwrap().clone()
    }
}

pub(crate) struct FakePage {
    url: Mutex<String>,
    images: Mutex<Vec<ImageRef>>,
    events: broadcast::Sender<PageEvent>,
}

impl FakePage {
    pub(crate) fn new(url: &str) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            url: Mutex::new(url.to_string()),
            images: Mutex::new(Vec::new()),
            events,
        })
    }

    pub(crate) fn add(&self, image: ImageRef) {
        self.images.lock().unwrap().push(image);
    }

    /// Insert images and report them the way a mutation watcher would.
    pub(crate) fn insert(&self, images: Vec<ImageRef>) {
        self.images.lock().unwrap().extend(images.iter().cloned());
        self.emit(PageEvent::NodesAdded(images));
    }

    pub(crate) fn remove(&self, id: ElementId) {
        self.images.lock().unwrap().retain(|i| i.id() != id);
    }

    pub(crate) fn set_url(&self, url: &str) {
        *self.url.lock().unwrap() = url.to_string();
        self.emit(PageEvent::UrlChanged(url.to_string()));
    }

    pub(crate) fn emit(&self, event: PageEvent) {
        let _ = self.events.send(event);
    }
}

impl Page for FakePage {
    fn url(&self) -> String {
        self.url.lock().unwrap().clone()
    }

    fn images(&self) -> Vec<ImageRef> {
        self.images.lock().unwrap().clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<PageEvent> {
        self.events.subscribe()
    }
}
