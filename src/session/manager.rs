//! Session lifecycle management.
//!
//! Creation, lookup with touch, explicit termination, timeout-based
//! eviction on a periodic sweep, and broadcast to every session with an
//! active stream. The table is a concurrent map: every request reads
//! it, while create/terminate/cleanup write it.

use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::Session;
use crate::config::SessionConfig;
use crate::context::RequestContext;
use crate::types::TransportKind;

pub struct SessionManager {
    sessions: DashMap<String, Arc<Session>>,
    transport: TransportKind,
    timeout: Duration,
    cleanup_interval: Duration,
    auto_cleanup: bool,
}

impl SessionManager {
    pub fn new(config: &SessionConfig, transport: TransportKind) -> Self {
        Self {
            sessions: DashMap::new(),
            transport,
            timeout: Duration::from_secs(config.timeout_secs),
            cleanup_interval: Duration::from_secs(config.cleanup_interval_secs),
            auto_cleanup: config.auto_cleanup,
        }
    }

    /// Session inactivity window.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Create a session, or return the existing one when the id is
    /// already live. A request context is snapshotted when provided;
    /// otherwise every session gets its own fresh minimal context.
    pub fn create(
        &self,
        id: Option<String>,
        request_context: Option<RequestContext>,
    ) -> Arc<Session> {
        let id = id.unwrap_or_else(generate_session_id);

        if let Some(existing) = self.sessions.get(&id) {
            let session = existing.clone();
            session.touch();
            return session;
        }

        let context = request_context
            .unwrap_or_else(|| RequestContext::minimal(self.transport));
        let session = Arc::new(Session::new(id.clone(), self.transport, context));

        // Entry API settles the race between two creators of one id.
        let stored = self
            .sessions
            .entry(id.clone())
            .or_insert_with(|| session.clone())
            .clone();

        if Arc::ptr_eq(&stored, &session) {
            info!(session_id = %id, transport = %self.transport, "Session created");
        }
        stored
    }

    /// Look up a session and refresh its access clock.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.get(id).map(|s| s.clone())?;
        session.touch();
        Some(session)
    }

    pub fn get_or_create(
        &self,
        id: Option<String>,
        request_context: Option<RequestContext>,
    ) -> Arc<Session> {
        match &id {
            Some(id) => match self.get(id) {
                Some(session) => session,
                None => self.create(Some(id.clone()), request_context),
            },
            None => self.create(None, request_context),
        }
    }

    /// Remove a session; its streaming connection is closed. Returns
    /// false when the id is unknown.
    pub fn terminate(&self, id: &str) -> bool {
        match self.sessions.remove(id) {
            Some((_, session)) => {
                self.on_session_terminated(&session);
                info!(session_id = %id, "Session terminated");
                true
            },
            None => false,
        }
    }

    /// Hook run for every session leaving the table, whether by
    /// explicit DELETE, eviction, or shutdown.
    fn on_session_terminated(&self, session: &Session) {
        if session.close_streaming() {
            debug!(session_id = %session.id(), "Closed streaming connection on terminate");
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Evict every session idle past the timeout. Returns the number
    /// evicted.
    pub fn cleanup_expired(&self) -> usize {
        let expired: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_expired(self.timeout))
            .map(|entry| entry.value().clone())
            .collect();

        let mut removed = 0;
        for session in expired {
            // Re-check under removal so a session touched since the
            // scan survives.
            if let Some((_, session)) = self
                .sessions
                .remove_if(session.id(), |_, s| s.is_expired(self.timeout))
            {
                self.on_session_terminated(&session);
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(removed, remaining = self.session_count(), "Evicted expired sessions");
        }
        removed
    }

    /// Terminate every session. Used at shutdown.
    pub fn cleanup_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, session)) = self.sessions.remove(&id) {
                self.on_session_terminated(&session);
            }
        }
        info!("All sessions terminated");
    }

    /// Deliver a notification to every session with an active stream.
    /// Returns the number of recipients successfully delivered to.
    pub fn broadcast(&self, message: Value) -> usize {
        let mut delivered = 0;
        for entry in self.sessions.iter() {
            if entry.value().send_streaming(message.clone()) {
                delivered += 1;
            }
        }
        debug!(delivered, "Broadcast notification");
        delivered
    }

    /// Spawn the periodic cleanup sweep. The task runs until the
    /// shutdown channel fires; it is a no-op when auto cleanup is
    /// disabled in config.
    pub fn spawn_cleanup_task(
        self: &Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if !self.auto_cleanup {
            debug!("Session auto-cleanup disabled");
            return None;
        }

        let manager = self.clone();
        let interval = self.cleanup_interval;

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.cleanup_expired();
                    }
                    _ = shutdown.recv() => {
                        debug!("Session cleanup task stopping");
                        break;
                    }
                }
            }
        }))
    }
}

/// Opaque, unguessable session id for HTTP clients.
pub fn generate_session_id() -> String {
    let id: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();
    id.to_ascii_lowercase()
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        let live = self.sessions.len();
        if live > 0 {
            warn!(live, "Session manager dropped with live sessions");
        }
    }
}
