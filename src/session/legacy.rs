//! Legacy shared-session SSE mode.
//!
//! One generated session is shared by every connected client, each with
//! its own streaming connection. This predates the one-session-per-
//! client HTTP stream transport and offers no tenant isolation, which
//! is why construction logs a deprecation warning. Kept for backward
//! compatibility; new deployments use [`super::SessionManager`].

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use super::manager::generate_session_id;
use super::{Session, StreamingConnection};
use crate::context::RequestContext;
use crate::types::TransportKind;

pub struct LegacySseSessionManager {
    shared: Arc<Session>,
    clients: DashMap<String, StreamingConnection>,
}

impl LegacySseSessionManager {
    pub fn new() -> Self {
        warn!(
            "Legacy SSE session mode is deprecated: all clients share one session. \
             Use the HTTP stream transport for per-client isolation."
        );

        let id = generate_session_id();
        let shared = Arc::new(Session::new(
            id,
            TransportKind::Sse,
            RequestContext::minimal(TransportKind::Sse),
        ));

        Self {
            shared,
            clients: DashMap::new(),
        }
    }

    /// The single session every client shares.
    pub fn session(&self) -> Arc<Session> {
        self.shared.clone()
    }

    /// Attach a client connection; returns its id.
    pub fn add_client(&self, conn: StreamingConnection) -> String {
        let id = conn.id().to_string();
        debug!(client_id = %id, "Legacy SSE client attached");
        self.clients.insert(id.clone(), conn);
        self.shared.touch();
        id
    }

    /// Detach and close a client connection.
    pub fn remove_client(&self, client_id: &str) -> bool {
        match self.clients.remove(client_id) {
            Some((_, conn)) => {
                conn.close();
                debug!(client_id, "Legacy SSE client detached");
                true
            },
            None => false,
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Deliver to every attached client; dead connections are dropped
    /// along the way. Returns the number of recipients successfully
    /// delivered to.
    pub fn broadcast(&self, message: Value) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();

        for entry in self.clients.iter() {
            if entry.value().try_send(message.clone()) {
                delivered += 1;
            } else {
                dead.push(entry.key().clone());
            }
        }

        for id in dead {
            self.remove_client(&id);
        }

        delivered
    }

    /// Close every client connection.
    pub fn close_all(&self) {
        let ids: Vec<String> = self.clients.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.remove_client(&id);
        }
    }
}

impl Default for LegacySseSessionManager {
    fn default() -> Self {
        Self::new()
    }
}
