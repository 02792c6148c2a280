//! # Relay Hub
//!
//! Routing table between in-page capture connections and live calls.
//!
//! A call binds its capture channel before the capture script is injected;
//! when the page connects to `/ws/capture?call_id=...` the WebSocket actor
//! attaches itself to that route and starts forwarding frames. Unbinding a
//! call closes the page connection, which in turn ends the actor.

use crate::audio::processor::AudioChunk;
use crate::error::{AppError, AppResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Commands pushed from the server to a connected page.
#[derive(Debug, Clone, PartialEq)]
pub enum PageCommand {
    /// Agent audio for in-page playback.
    Audio(Vec<u8>),
    /// Drop whatever the page has queued for playback.
    ClearPlayback,
    /// Close the capture connection.
    Close,
}

struct Route {
    capture_tx: mpsc::Sender<AudioChunk>,
    page_tx: Option<mpsc::UnboundedSender<PageCommand>>,
}

/// Shared call-id → route map. Cloning shares the same table.
#[derive(Clone, Default)]
pub struct RelayHub {
    routes: Arc<RwLock<HashMap<String, Route>>>,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the capture channel for a call.
    ///
    /// Rebinding an existing call replaces its channel and closes any page
    /// still attached to the old route.
    pub fn bind(&self, call_id: &str, capture_tx: mpsc::Sender<AudioChunk>) {
        let previous = self.routes.write().insert(
            call_id.to_string(),
            Route {
                capture_tx,
                page_tx: None,
            },
        );
        if let Some(Route {
            page_tx: Some(page), ..
        }) = previous
        {
            let _ = page.send(PageCommand::Close);
        }
        info!("Relay route bound for call {}", call_id);
    }

    /// Attach a page connection to a bound call.
    ///
    /// Returns the capture channel the page's frames go to.
    pub fn attach_page(
        &self,
        call_id: &str,
        page_tx: mpsc::UnboundedSender<PageCommand>,
    ) -> AppResult<mpsc::Sender<AudioChunk>> {
        let mut routes = self.routes.write();
        let route = routes
            .get_mut(call_id)
            .ok_or_else(|| AppError::NotFound(format!("No relay route for call {}", call_id)))?;

        if let Some(old) = route.page_tx.replace(page_tx) {
            let _ = old.send(PageCommand::Close);
        }
        debug!("Page attached to call {}", call_id);
        Ok(route.capture_tx.clone())
    }

    /// Forget `page_tx` without closing the route. A newer page that
    /// replaced it stays attached.
    pub fn detach_page(&self, call_id: &str, page_tx: &mpsc::UnboundedSender<PageCommand>) {
        if let Some(route) = self.routes.write().get_mut(call_id) {
            if route
                .page_tx
                .as_ref()
                .is_some_and(|current| current.same_channel(page_tx))
            {
                route.page_tx = None;
            }
        }
    }

    /// Remove the route and close its page connection. Safe to repeat.
    pub fn unbind(&self, call_id: &str) -> bool {
        let removed = self.routes.write().remove(call_id);
        match removed {
            Some(route) => {
                if let Some(page) = route.page_tx {
                    let _ = page.send(PageCommand::Close);
                }
                info!("Relay route closed for call {}", call_id);
                true
            }
            None => false,
        }
    }

    /// Push a command to the page attached to `call_id`.
    ///
    /// Returns `false` when no page is attached.
    pub fn send_to_page(&self, call_id: &str, command: PageCommand) -> bool {
        let routes = self.routes.read();
        match routes.get(call_id).and_then(|r| r.page_tx.as_ref()) {
            Some(page) => page.send(command).is_ok(),
            None => false,
        }
    }

    pub fn is_bound(&self, call_id: &str) -> bool {
        self.routes.read().contains_key(call_id)
    }

    pub fn has_page(&self, call_id: &str) -> bool {
        self.routes
            .read()
            .get(call_id)
            .map(|r| r.page_tx.is_some())
            .unwrap_or(false)
    }

    pub fn active_routes(&self) -> usize {
        self.routes.read().len()
    }
}
