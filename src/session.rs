//! Discovery queue: one processing session over one page.
//!
//! A session discovers qualifying images, queues them in discovery order and
//! drains the queue with a single worker, so at most one OCR submission is
//! outstanding per page. Navigation trips the session's [`NavigationEpoch`];
//! queued work is dropped and the page watcher disconnects, while an item
//! already past its start check runs to completion.
//!
//! ```text
//! Page ──events──▶ watcher ──▶ discover ──▶ admit ──▶ queue ──▶ drain (one worker)
//!                                                                  │
//!                  acquire → OCR (≤ 120s) → overlay → annotate ◀───┘
//! ```

use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::future::{join_all, BoxFuture};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::acquire::ImageAcquirer;
use crate::config::Settings;
use crate::ocr::{OcrError, OcrService};
use crate::overlay::{Overlay, OverlayError};
use crate::page::{Annotation, ElementId, ImageElement, ImageRef, Page, PageEvent};
use crate::site::{DiscoveryProtocol, ProtocolRouter};

/// Tripped once when the page navigates away. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct NavigationEpoch {
    token: CancellationToken,
}

impl NavigationEpoch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trip(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_tripped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the epoch has been tripped.
    pub async fn tripped(&self) {
        self.token.cancelled().await;
    }
}

#[derive(Error, Debug)]
enum ItemError {
    #[error("no acquisition strategy produced an image")]
    ExtractionFailure,

    #[error(transparent)]
    OcrUnavailable(#[from] OcrError),

    #[error("overlay failed: {0}")]
    Overlay(#[from] OverlayError),
}

/// How one queued image ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Text found, overlay attached.
    Overlaid,
    /// OCR answered with no text; nothing to draw.
    NoText,
    Failed,
    /// Already processed, or the session was stopped first.
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub observed: usize,
    pub processed: usize,
    pub failed: usize,
    pub queued: usize,
}

#[derive(Default)]
struct ProcessingState {
    observed: HashSet<ElementId>,
    processed: HashSet<ElementId>,
    failed: HashSet<ElementId>,
    queue: VecDeque<Weak<dyn ImageElement>>,
    working: bool,
}

/// Collaborators a session drives.
#[derive(Clone)]
pub struct SessionDeps {
    pub acquirer: Arc<ImageAcquirer>,
    pub ocr: Arc<dyn OcrService>,
    pub overlay: Arc<dyn Overlay>,
    pub settings: watch::Receiver<Settings>,
}

struct SessionInner {
    page: Arc<dyn Page>,
    start_url: String,
    protocol: Arc<dyn DiscoveryProtocol>,
    deps: SessionDeps,
    epoch: NavigationEpoch,
    state: Mutex<ProcessingState>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    idle: Notify,
}

/// Cheap handle to a running session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl Session {
    /// Build an idle session. The protocol is chosen here, from the page host
    /// at this moment, and kept for the session's lifetime.
    #[must_use]
    pub fn new(page: Arc<dyn Page>, deps: SessionDeps, router: &ProtocolRouter) -> Self {
        let protocol = router.select(page.host().as_deref());
        let start_url = page.url();
        info!(url = %start_url, protocol = protocol.name(), "Session created");
        Self {
            inner: Arc::new(SessionInner {
                page,
                start_url,
                protocol,
                deps,
                epoch: NavigationEpoch::new(),
                state: Mutex::new(ProcessingState::default()),
                watcher: Mutex::new(None),
                idle: Notify::new(),
            }),
        }
    }

    /// Create a session, watch the page, scan what is already there and start
    /// draining.
    ///
    /// The watcher subscribes before the scan so nothing inserted meanwhile
    /// is missed; anything seen by both is admitted once.
    pub async fn start(page: Arc<dyn Page>, deps: SessionDeps, router: &ProtocolRouter) -> Self {
        let session = Self::new(page, deps, router);
        session.connect_watcher();
        session.scan().await;
        session.kick();
        session
    }

    #[must_use]
    pub fn epoch(&self) -> &NavigationEpoch {
        &self.inner.epoch
    }

    #[must_use]
    pub fn protocol_name(&self) -> &'static str {
        self.inner.protocol.name()
    }

    #[must_use]
    pub fn stats(&self) -> SessionStats {
        let state = lock(&self.inner.state);
        SessionStats {
            observed: state.observed.len(),
            processed: state.processed.len(),
            failed: state.failed.len(),
            queued: state.queue.len(),
        }
    }

    #[must_use]
    pub fn is_observed(&self, id: ElementId) -> bool {
        lock(&self.inner.state).observed.contains(&id)
    }

    #[must_use]
    pub fn is_processed(&self, id: ElementId) -> bool {
        lock(&self.inner.state).processed.contains(&id)
    }

    #[must_use]
    pub fn is_failed(&self, id: ElementId) -> bool {
        lock(&self.inner.state).failed.contains(&id)
    }

    #[must_use]
    pub fn is_watching(&self) -> bool {
        lock(&self.inner.watcher)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Evaluate every image currently on the page. Returns how many were
    /// admitted.
    pub async fn scan(&self) -> usize {
        let images = self.inner.page.images();
        let admitted = self.discover(images).await;
        info!(admitted, "Page scan complete");
        admitted
    }

    /// Evaluate one image and admit it if it qualifies, starting the worker
    /// when needed.
    pub async fn consider(&self, image: ImageRef) -> bool {
        let admitted = self.discover(vec![image]).await > 0;
        if admitted {
            self.kick();
        }
        admitted
    }

    /// Evaluate images concurrently, then admit the qualifying ones in the
    /// order given.
    async fn discover(&self, images: Vec<ImageRef>) -> usize {
        let candidates: Vec<ImageRef> = {
            let state = lock(&self.inner.state);
            images
                .into_iter()
                .filter(|image| {
                    let id = image.id();
                    !state.observed.contains(&id) && !state.processed.contains(&id)
                })
                .collect()
        };
        if candidates.is_empty() || self.inner.epoch.is_tripped() {
            return 0;
        }

        let floor = self.inner.deps.settings.borrow().size_floor();
        let verdicts = join_all(
            candidates
                .iter()
                .map(|image| self.inner.protocol.evaluate(image.as_ref(), floor)),
        )
        .await;

        candidates
            .iter()
            .zip(verdicts)
            .filter(|(image, qualifies)| *qualifies && self.admit(image))
            .count()
    }

    /// Record an image as observed and queue it. Each element is admitted at
    /// most once per session.
    fn admit(&self, image: &ImageRef) -> bool {
        let mut state = lock(&self.inner.state);
        if self.inner.epoch.is_tripped() || !state.observed.insert(image.id()) {
            return false;
        }
        state.queue.push_back(Arc::downgrade(image));
        debug!(id = image.id(), queued = state.queue.len(), "Image admitted");
        true
    }

    /// Claim the worker slot if it is free and there is work.
    fn claim(&self) -> bool {
        let mut state = lock(&self.inner.state);
        if state.working || state.queue.is_empty() || self.inner.epoch.is_tripped() {
            return false;
        }
        state.working = true;
        true
    }

    /// Start a drain task unless one is already running.
    pub fn kick(&self) -> Option<JoinHandle<()>> {
        if !self.claim() {
            return None;
        }
        let session = self.clone();
        Some(tokio::spawn(async move { session.drain_claimed().await }))
    }

    /// Drain the queue on the current task. Returns immediately if another
    /// worker is already draining.
    pub async fn drain(&self) {
        if self.claim() {
            self.drain_claimed().await;
        }
    }

    async fn drain_claimed(&self) {
        loop {
            // Popping and releasing the worker slot happen under one lock, so
            // an admission either lands before the slot is released or finds
            // it free and starts a new worker.
            let next = {
                let mut state = lock(&self.inner.state);
                if self.inner.epoch.is_tripped() {
                    state.queue.clear();
                    state.working = false;
                    None
                } else if let Some(next) = state.queue.pop_front() {
                    Some(next)
                } else {
                    state.working = false;
                    None
                }
            };
            let Some(next) = next else {
                break;
            };
            let Some(image) = next.upgrade() else {
                debug!("Queued image left the page");
                continue;
            };
            self.process(image).await;
        }

        self.inner.idle.notify_waiters();
        let stats = self.stats();
        info!(
            processed = stats.processed,
            failed = stats.failed,
            observed = stats.observed,
            "Queue drained"
        );
    }

    /// Wait until no worker is running and nothing is queued.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            {
                let state = lock(&self.inner.state);
                if !state.working && (state.queue.is_empty() || self.inner.epoch.is_tripped()) {
                    return;
                }
            }
            self.kick();
            notified.await;
        }
    }

    /// Run one image through the pipeline. Never panics or errors out; the
    /// outcome is recorded in the session state.
    pub(crate) async fn process(&self, image: ImageRef) -> ItemOutcome {
        let id = image.id();
        {
            let mut state = lock(&self.inner.state);
            if self.inner.epoch.is_tripped() || !state.processed.insert(id) {
                return ItemOutcome::Skipped;
            }
            // processed ⊆ observed, even for callers that skipped admission.
            state.observed.insert(id);
        }

        image.set_processing(true);
        let result = AssertUnwindSafe(self.run_pipeline(&image))
            .catch_unwind()
            .await;
        image.set_processing(false);

        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(id, error = %e, "Image failed");
                ItemOutcome::Failed
            }
            Err(_) => {
                error!(id, "Image processing panicked");
                ItemOutcome::Failed
            }
        };
        if outcome == ItemOutcome::Failed {
            lock(&self.inner.state).failed.insert(id);
        }
        outcome
    }

    async fn run_pipeline(&self, image: &ImageRef) -> Result<ItemOutcome, ItemError> {
        let deps = &self.inner.deps;
        let page_url = self.inner.page.url();

        // Settings are read per item so a change applies from the next one on.
        let (floor, target_lang, limit) = {
            let settings = deps.settings.borrow();
            (
                settings.size_floor(),
                settings.target_lang.clone(),
                settings.ocr_timeout(),
            )
        };

        let payload = deps
            .acquirer
            .acquire(image.as_ref(), &page_url, floor, &self.inner.epoch)
            .await
            .ok_or(ItemError::ExtractionFailure)?;

        let blocks = tokio::time::timeout(limit, deps.ocr.recognize(&payload, &target_lang))
            .await
            .map_err(|_| OcrError::Timeout(limit.as_secs()))??;

        if blocks.is_empty() {
            info!(id = image.id(), "No text detected");
            return Ok(ItemOutcome::NoText);
        }

        let translated = deps.overlay.render(&payload, &blocks).await?;
        image.annotate(Annotation::translated(payload, translated));
        info!(id = image.id(), blocks = blocks.len(), "Overlay attached");
        Ok(ItemOutcome::Overlaid)
    }

    /// Subscribe to page events and react to them on a background task.
    ///
    /// Discoveries run alongside the receive loop, so a navigation event is
    /// acted on as soon as it arrives even while images are still loading.
    pub fn connect_watcher(&self) {
        let mut events = self.inner.page.subscribe();
        let session = self.clone();
        let handle = tokio::spawn(async move {
            let mut discoveries: FuturesUnordered<BoxFuture<'static, usize>> =
                FuturesUnordered::new();
            loop {
                tokio::select! {
                    () = session.inner.epoch.tripped() => break,
                    Some(admitted) = discoveries.next(), if !discoveries.is_empty() => {
                        if admitted > 0 {
                            session.kick();
                        }
                    }
                    event = events.recv() => {
                        let found = match event {
                            Ok(event) => session.on_event(event),
                            Err(RecvError::Lagged(missed)) => {
                                warn!(missed, "Page events lagged; rescanning");
                                Some(session.inner.page.images())
                            }
                            Err(RecvError::Closed) => break,
                        };
                        if let Some(images) = found {
                            let discovering = session.clone();
                            discoveries.push(
                                async move { discovering.discover(images).await }.boxed(),
                            );
                        }
                    }
                }
            }
            debug!("Page watcher disconnected");
        });
        if let Some(previous) = lock(&self.inner.watcher).replace(handle) {
            previous.abort();
        }
    }

    /// Act on one page event. Returns images that need evaluating.
    fn on_event(&self, event: PageEvent) -> Option<Vec<ImageRef>> {
        match event {
            PageEvent::NodesAdded(images) => return Some(images),
            PageEvent::SourceChanged(image) => return Some(vec![image]),
            PageEvent::UrlChanged(url) => {
                if url != self.inner.start_url {
                    self.stop("url changed");
                }
            }
            PageEvent::Unload => self.stop("unload"),
            PageEvent::HistoryNavigation => self.stop("history navigation"),
        }
        None
    }

    /// Trip the epoch, drop queued work and disconnect the watcher.
    pub fn stop(&self, reason: &str) {
        self.inner.epoch.trip();
        let dropped = {
            let mut state = lock(&self.inner.state);
            let dropped = state.queue.len();
            state.queue.clear();
            dropped
        };
        if let Some(watcher) = lock(&self.inner.watcher).take() {
            watcher.abort();
        }
        self.inner.idle.notify_waiters();
        let stats = self.stats();
        info!(
            reason,
            dropped,
            processed = stats.processed,
            failed = stats.failed,
            observed = stats.observed,
            "Session stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquire::tests::FakeChannel;
    use crate::config::SettingsStore;
    use crate::fetch_bridge::PrivilegedChannel;
    use crate::ocr::{BoundingBox, TextBlock};
    use crate::page::fake::{FakeImage, FakePage};
    use crate::page::ToggleState;
    use crate::payload::ImagePayload;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    struct Call {
        payload: ImagePayload,
        lang: String,
        start: Instant,
        end: Instant,
    }

    /// OCR double that records every call and how many overlap.
    struct FakeOcr {
        blocks: Vec<TextBlock>,
        delay: Duration,
        fail: bool,
        calls: std::sync::Mutex<Vec<Call>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        entered: Notify,
    }

    impl FakeOcr {
        fn answering(blocks: Vec<TextBlock>) -> Arc<Self> {
            Arc::new(Self {
                blocks,
                delay: Duration::from_millis(10),
                fail: false,
                calls: std::sync::Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                entered: Notify::new(),
            })
        }

        fn with_text() -> Arc<Self> {
            Self::answering(vec![block()])
        }

        fn slow(delay: Duration) -> Arc<Self> {
            let mut ocr = Arc::into_inner(Self::with_text()).unwrap();
            ocr.delay = delay;
            Arc::new(ocr)
        }

        fn broken() -> Arc<Self> {
            let mut ocr = Arc::into_inner(Self::with_text()).unwrap();
            ocr.fail = true;
            Arc::new(ocr)
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl OcrService for FakeOcr {
        async fn recognize(
            &self,
            image: &ImagePayload,
            target_lang: &str,
        ) -> Result<Vec<TextBlock>, OcrError> {
            let start = Instant::now();
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.entered.notify_one();
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.calls.lock().unwrap().push(Call {
                payload: image.clone(),
                lang: target_lang.to_string(),
                start,
                end: Instant::now(),
            });
            if self.fail {
                Err(OcrError::Status(500))
            } else {
                Ok(self.blocks.clone())
            }
        }
    }

    #[derive(Default)]
    struct CountingOverlay {
        renders: AtomicUsize,
    }

    #[async_trait]
    impl Overlay for CountingOverlay {
        async fn render(
            &self,
            _original: &ImagePayload,
            _blocks: &[TextBlock],
        ) -> Result<ImagePayload, OverlayError> {
            self.renders.fetch_add(1, Ordering::SeqCst);
            Ok(ImagePayload::png(b"translated"))
        }
    }

    struct PanickingOverlay;

    #[async_trait]
    impl Overlay for PanickingOverlay {
        async fn render(
            &self,
            _original: &ImagePayload,
            _blocks: &[TextBlock],
        ) -> Result<ImagePayload, OverlayError> {
            panic!("renderer blew up");
        }
    }

    fn block() -> TextBlock {
        TextBlock {
            text: "Hello".into(),
            bbox: BoundingBox {
                x0: 1.0,
                y0: 1.0,
                x1: 50.0,
                y1: 20.0,
            },
            kind: "text_bubble".into(),
            style: "normal".into(),
            original_text: Some("こんにちは".into()),
            translated_text: Some("Hello".into()),
        }
    }

    struct Harness {
        page: Arc<FakePage>,
        channel: Arc<FakeChannel>,
        ocr: Arc<FakeOcr>,
        overlay: Arc<CountingOverlay>,
        store: SettingsStore,
    }

    impl Harness {
        fn new(url: &str, ocr: Arc<FakeOcr>) -> Self {
            Self {
                page: FakePage::new(url),
                channel: FakeChannel::succeeding(),
                ocr,
                overlay: Arc::new(CountingOverlay::default()),
                store: SettingsStore::new(Settings::default()),
            }
        }

        fn deps_with_overlay(&self, overlay: Arc<dyn Overlay>) -> SessionDeps {
            SessionDeps {
                acquirer: Arc::new(ImageAcquirer::new(
                    Arc::clone(&self.channel) as Arc<dyn PrivilegedChannel>
                )),
                ocr: Arc::clone(&self.ocr) as Arc<dyn OcrService>,
                overlay,
                settings: self.store.subscribe(),
            }
        }

        fn deps(&self) -> SessionDeps {
            self.deps_with_overlay(Arc::clone(&self.overlay) as Arc<dyn Overlay>)
        }

        fn session(&self) -> Session {
            Session::new(
                Arc::clone(&self.page) as Arc<dyn Page>,
                self.deps(),
                &ProtocolRouter::new(),
            )
        }

        async fn start(&self) -> Session {
            Session::start(
                Arc::clone(&self.page) as Arc<dyn Page>,
                self.deps(),
                &ProtocolRouter::new(),
            )
            .await
        }

        fn add(&self, image: FakeImage) -> Arc<FakeImage> {
            let image = image.shared();
            self.page.add(Arc::clone(&image) as ImageRef);
            image
        }
    }

    const READER: &str = "https://reader.example/chapter/1";

    fn page_image(n: u32) -> FakeImage {
        FakeImage::new(&format!("https://reader.example/pages/{n}.png"), 800, 1200)
    }

    #[tokio::test]
    async fn same_element_is_admitted_once() {
        let h = Harness::new(READER, FakeOcr::with_text());
        let image = h.add(page_image(1));
        let session = h.session();

        assert_eq!(session.scan().await, 1);
        assert_eq!(session.scan().await, 0);
        h.page.emit(PageEvent::NodesAdded(vec![Arc::clone(&image) as ImageRef]));
        assert!(!session.consider(Arc::clone(&image) as ImageRef).await);
        assert_eq!(session.stats().queued, 1);

        session.drain().await;
        assert_eq!(h.ocr.call_count(), 1);

        // Processed elements are never re-admitted either.
        assert!(!session.consider(image as ImageRef).await);
        assert_eq!(session.stats().observed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ocr_submissions_never_overlap() {
        let h = Harness::new(READER, FakeOcr::slow(Duration::from_secs(3)));
        for n in 0..4 {
            h.add(page_image(n));
        }
        let session = h.session();
        session.scan().await;

        let first = session.kick().unwrap();
        assert!(session.kick().is_none());
        session.drain().await;
        first.await.unwrap();

        assert_eq!(h.ocr.call_count(), 4);
        assert_eq!(h.ocr.max_in_flight.load(Ordering::SeqCst), 1);
        let calls = h.ocr.calls.lock().unwrap();
        for pair in calls.windows(2) {
            assert!(pair[0].end <= pair[1].start);
        }
    }

    #[tokio::test]
    async fn items_run_in_admission_order() {
        let h = Harness::new(READER, FakeOcr::with_text());
        let images: Vec<_> = (0..3).map(|n| h.add(page_image(n))).collect();
        let session = h.session();
        session.scan().await;
        session.drain().await;

        let calls = h.ocr.calls.lock().unwrap();
        let order: Vec<_> = calls.iter().map(|c| c.payload.clone()).collect();
        let expected: Vec<_> = images.iter().map(|i| i.drawn_payload()).collect();
        assert_eq!(order, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn navigation_mid_drain_finishes_current_item_only() {
        let h = Harness::new(READER, FakeOcr::slow(Duration::from_secs(5)));
        let images: Vec<_> = (0..3).map(|n| h.add(page_image(n))).collect();
        let session = h.session();
        session.connect_watcher();
        session.scan().await;
        let worker = session.kick().unwrap();

        h.ocr.entered.notified().await;
        h.page.emit(PageEvent::Unload);
        worker.await.unwrap();

        assert!(session.epoch().is_tripped());
        assert_eq!(h.ocr.call_count(), 1);
        assert!(images[0].annotation().is_some());
        assert!(!session.is_processed(images[1].id()));
        assert_eq!(images[1].draws.load(Ordering::SeqCst), 0);
        assert_eq!(session.stats().queued, 0);
        assert!(!session.is_watching());

        // Late discoveries are ignored.
        h.page.insert(vec![page_image(9).shared() as ImageRef]);
        assert!(!session.consider(page_image(10).shared() as ImageRef).await);
        assert_eq!(session.stats().observed, 3);
    }

    #[tokio::test]
    async fn same_origin_page_image_is_drawn_and_overlaid() {
        let h = Harness::new(READER, FakeOcr::with_text());
        let image = h.add(FakeImage::new("https://reader.example/pages/1.png", 300, 400));

        let session = h.start().await;
        session.wait_idle().await;

        assert_eq!(session.protocol_name(), "generic");
        assert_eq!(image.draws.load(Ordering::SeqCst), 1);
        assert!(h.channel.kinds().is_empty());
        let calls = h.ocr.calls.lock().unwrap();
        assert_eq!(calls[0].payload, image.drawn_payload());
        assert_eq!(calls[0].lang, "Korean");

        let annotation = image.annotation().unwrap();
        assert_eq!(annotation.state, ToggleState::Translated);
        assert_eq!(annotation.original, image.drawn_payload());
        assert_eq!(h.overlay.renders.load(Ordering::SeqCst), 1);
        assert!(!image.processing.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn pixiv_thumbnail_is_fetched_at_full_resolution() {
        let h = Harness::new("https://www.pixiv.net/artworks/1", FakeOcr::with_text());
        let image = h.add(FakeImage::new(
            "https://i.pximg.net/c/250x250_80_a2/img-master/img/1/sample_p0_square1200.jpg",
            1200,
            1200,
        ));

        let session = h.start().await;
        session.wait_idle().await;

        assert_eq!(session.protocol_name(), "pixiv");
        assert_eq!(
            image.resolved_original().as_deref(),
            Some("https://i.pximg.net/img-master/img/1/sample_p0_master1200.jpg")
        );
        assert_eq!(h.channel.kinds(), vec!["FETCH_IMAGE_OFFSCREEN"]);
        assert_eq!(image.draws.load(Ordering::SeqCst), 0);
        assert!(image.annotation().is_some());
    }

    #[tokio::test]
    async fn empty_ocr_result_is_processed_without_overlay() {
        let h = Harness::new(READER, FakeOcr::answering(Vec::new()));
        let image = h.add(page_image(1));
        let session = h.session();
        session.scan().await;

        assert_eq!(
            session.process(Arc::clone(&image) as ImageRef).await,
            ItemOutcome::NoText
        );
        assert!(session.is_processed(image.id()));
        assert!(!session.is_failed(image.id()));
        assert!(image.annotation().is_none());
        assert_eq!(h.overlay.renders.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn small_images_are_never_admitted() {
        for url in [READER, "https://www.pixiv.net/artworks/2"] {
            let h = Harness::new(url, FakeOcr::with_text());
            let icon = h.add(FakeImage::new("https://reader.example/icon.png", 150, 150));
            let session = h.start().await;
            session.wait_idle().await;

            assert!(!session.is_observed(icon.id()));
            assert_eq!(h.ocr.call_count(), 0);
        }
    }

    #[tokio::test]
    async fn extraction_failure_marks_failed_and_moves_on() {
        let mut h = Harness::new(READER, FakeOcr::with_text());
        h.channel = FakeChannel::failing();
        let blocked = h.add(FakeImage::new("https://cdn.other.net/1.jpg", 800, 800).tainted());
        let fine = h.add(page_image(2));

        let session = h.start().await;
        session.wait_idle().await;

        assert!(session.is_failed(blocked.id()));
        assert!(session.is_processed(blocked.id()));
        assert!(fine.annotation().is_some());
        assert_eq!(session.stats().failed, 1);
    }

    #[tokio::test]
    async fn ocr_error_marks_failed() {
        let h = Harness::new(READER, FakeOcr::broken());
        let image = h.add(page_image(1));
        let session = h.session();
        session.scan().await;

        assert_eq!(
            session.process(Arc::clone(&image) as ImageRef).await,
            ItemOutcome::Failed
        );
        assert!(session.is_failed(image.id()));
        assert!(image.annotation().is_none());
        assert!(!image.processing.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn ocr_is_abandoned_after_its_timeout() {
        let h = Harness::new(READER, FakeOcr::slow(Duration::from_secs(600)));
        let image = h.add(page_image(1));
        let session = h.session();
        session.scan().await;

        let started = Instant::now();
        let outcome = session.process(Arc::clone(&image) as ImageRef).await;

        assert_eq!(outcome, ItemOutcome::Failed);
        assert!(started.elapsed() >= Duration::from_secs(120));
        assert!(started.elapsed() < Duration::from_secs(121));
        assert!(session.is_failed(image.id()));
    }

    #[tokio::test]
    async fn panicking_overlay_is_contained() {
        let h = Harness::new(READER, FakeOcr::with_text());
        let first = h.add(page_image(1));
        let second = h.add(page_image(2));
        let session = Session::new(
            Arc::clone(&h.page) as Arc<dyn Page>,
            h.deps_with_overlay(Arc::new(PanickingOverlay)),
            &ProtocolRouter::new(),
        );
        session.scan().await;
        session.drain().await;

        assert!(session.is_failed(first.id()));
        assert!(session.is_failed(second.id()));
        assert_eq!(h.ocr.call_count(), 2);
        assert!(!first.processing.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn inserted_images_are_discovered_incrementally() {
        let h = Harness::new(READER, FakeOcr::with_text());
        let session = h.start().await;
        session.wait_idle().await;
        assert_eq!(session.stats().observed, 0);

        let late = page_image(7).shared();
        h.page.insert(vec![Arc::clone(&late) as ImageRef]);

        tokio::time::timeout(Duration::from_secs(5), async {
            while late.annotation().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        session.wait_idle().await;
        assert!(session.is_processed(late.id()));
        assert_eq!(h.ocr.call_count(), 1);
    }

    #[tokio::test]
    async fn url_change_stops_the_session() {
        let h = Harness::new(READER, FakeOcr::with_text());
        let session = h.start().await;

        // Same URL reported again is not a navigation.
        h.page.emit(PageEvent::UrlChanged(READER.into()));
        tokio::task::yield_now().await;
        assert!(!session.epoch().is_tripped());

        h.page.set_url("https://reader.example/chapter/2");
        tokio::time::timeout(Duration::from_secs(5), session.epoch().tripped())
            .await
            .unwrap();
        assert!(!session.is_watching());
    }

    #[tokio::test]
    async fn language_change_applies_to_next_item() {
        let h = Harness::new(READER, FakeOcr::with_text());
        let first = h.add(page_image(1));
        let second = h.add(page_image(2));
        let session = h.session();
        session.scan().await;

        session.process(first as ImageRef).await;
        h.store.update(|s| s.target_lang = "English".into());
        session.process(second as ImageRef).await;

        let langs: Vec<_> = h
            .ocr
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.lang.clone())
            .collect();
        assert_eq!(langs, vec!["Korean", "English"]);
    }

    #[tokio::test]
    async fn removed_elements_are_skipped() {
        let h = Harness::new(READER, FakeOcr::with_text());
        let gone = h.add(page_image(1));
        let id = gone.id();
        let session = h.session();
        assert_eq!(session.scan().await, 1);

        // The page and the test hold the only strong references.
        h.page.remove(id);
        drop(gone);
        session.drain().await;

        assert_eq!(h.ocr.call_count(), 0);
        assert!(session.is_observed(id));
        assert!(!session.is_processed(id));
    }

    #[tokio::test]
    async fn floor_follows_settings() {
        let h = Harness::new(READER, FakeOcr::with_text());
        let small = h.add(FakeImage::new("https://reader.example/s.png", 150, 150));
        let session = h.session();
        h.store.update(|s| {
            s.min_width = 100;
            s.min_height = 100;
        });

        assert_eq!(session.scan().await, 1);
        session.drain().await;

        assert!(session.is_observed(small.id()));
        assert!(session.is_processed(small.id()));
        assert!(!session.is_failed(small.id()));
        assert_eq!(h.ocr.call_count(), 1);
        assert!(small.annotation().is_some());
    }

    #[tokio::test]
    async fn processed_images_are_always_observed() {
        let h = Harness::new(READER, FakeOcr::with_text());
        let image = h.add(page_image(1));
        let session = h.session();

        session.process(Arc::clone(&image) as ImageRef).await;

        assert!(session.is_processed(image.id()));
        assert!(session.is_observed(image.id()));
        assert!(!session.consider(image as ImageRef).await);
        assert_eq!(session.stats().observed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unload_is_handled_while_an_insert_is_still_loading() {
        let h = Harness::new(READER, FakeOcr::slow(Duration::from_secs(1)));
        for n in 0..5 {
            h.add(page_image(n));
        }
        let session = h.start().await;
        h.ocr.entered.notified().await;

        // Evaluating this one waits on its load for up to 2 s.
        h.page.insert(vec![page_image(9).pending().shared() as ImageRef]);
        h.page.emit(PageEvent::Unload);
        session.wait_idle().await;

        assert!(session.epoch().is_tripped());
        assert_eq!(h.ocr.call_count(), 1);
        assert_eq!(session.stats().queued, 0);
        assert_eq!(session.stats().observed, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn history_navigation_mid_drain_finishes_current_item_only() {
        let h = Harness::new(READER, FakeOcr::slow(Duration::from_secs(5)));
        let images: Vec<_> = (0..3).map(|n| h.add(page_image(n))).collect();
        let session = h.start().await;

        h.ocr.entered.notified().await;
        h.page.emit(PageEvent::HistoryNavigation);
        session.wait_idle().await;

        assert!(session.epoch().is_tripped());
        assert_eq!(h.ocr.call_count(), 1);
        assert!(images[0].annotation().is_some());
        assert!(!session.is_processed(images[1].id()));
        assert!(!session.is_processed(images[2].id()));
        assert!(!session.is_watching());
    }

    #[tokio::test]
    async fn changed_source_is_discovered() {
        let h = Harness::new(READER, FakeOcr::with_text());
        let session = h.start().await;
        session.wait_idle().await;

        let swapped = page_image(4).shared();
        h.page.emit(PageEvent::SourceChanged(Arc::clone(&swapped) as ImageRef));

        tokio::time::timeout(Duration::from_secs(5), async {
            while swapped.annotation().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        session.wait_idle().await;
        assert!(session.is_processed(swapped.id()));
        assert_eq!(h.ocr.call_count(), 1);
    }

    #[tokio::test]
    async fn lagged_watcher_rescans_the_page() {
        let h = Harness::new(READER, FakeOcr::with_text());
        let session = h.start().await;
        session.wait_idle().await;

        // Added without an event; only a rescan can find it.
        let quiet = h.add(page_image(5));
        for _ in 0..70 {
            h.page.emit(PageEvent::UrlChanged(READER.into()));
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while quiet.annotation().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!session.epoch().is_tripped());
        assert!(session.is_processed(quiet.id()));
    }
}
