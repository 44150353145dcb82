//! Turns the `enabled` setting into a running session.
//!
//! Enabling starts a fresh session on the current page; disabling stops the
//! running one. Other settings (language, endpoint) are read where they are
//! used and need no action here.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::page::Page;
use crate::session::{Session, SessionDeps};
use crate::site::ProtocolRouter;

/// Owns the settings subscription and at most one session for a page.
pub struct Controller {
    page: Arc<dyn Page>,
    deps: SessionDeps,
    router: ProtocolRouter,
    session: Mutex<Option<Session>>,
}

impl Controller {
    #[must_use]
    pub fn new(page: Arc<dyn Page>, deps: SessionDeps) -> Self {
        Self {
            page,
            deps,
            router: ProtocolRouter::new(),
            session: Mutex::new(None),
        }
    }

    /// The running session, if any.
    pub async fn session(&self) -> Option<Session> {
        self.session.lock().await.clone()
    }

    /// Bring the session in line with the current `enabled` flag.
    pub async fn sync(&self) {
        let enabled = self.deps.settings.borrow().enabled;
        let mut slot = self.session.lock().await;
        match (enabled, slot.is_some()) {
            (true, false) => {
                info!(url = %self.page.url(), "Enabled; starting session");
                let session =
                    Session::start(Arc::clone(&self.page), self.deps.clone(), &self.router).await;
                *slot = Some(session);
            }
            (false, true) => {
                if let Some(session) = slot.take() {
                    session.stop("disabled");
                }
            }
            _ => debug!(enabled, "Session already in the requested state"),
        }
    }

    /// Sync now and again on every settings change, until the settings
    /// source goes away.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let mut changes = self.deps.settings.clone();
        tokio::spawn(async move {
            drop(changes.borrow_and_update());
            self.sync().await;
            while changes.changed().await.is_ok() {
                self.sync().await;
            }
            debug!("Settings source closed");
        })
    }
}
