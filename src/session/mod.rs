//! Per-client session state.
//!
//! A session is the named channel between one client and the server.
//! It owns its request context (never shared with another session), an
//! access clock used for timeout eviction, free-form metadata, and at
//! most one streaming connection at a time.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::context::RequestContext;
use crate::types::TransportKind;

pub mod legacy;
pub mod manager;

pub use manager::SessionManager;

/// Fixed id for the single stdio session.
pub const STDIO_SESSION_ID: &str = "stdio";

/// Server-side writable end of an open SSE stream.
///
/// Messages pushed here are drained by the per-stream pump task, which
/// assigns event ids and renders SSE frames. The sender side never
/// blocks: a full channel counts as a delivery failure.
pub struct StreamingConnection {
    id: String,
    tx: mpsc::Sender<Value>,
    closed: Arc<AtomicBool>,
}

impl StreamingConnection {
    /// Create a connection and hand back the receiving half for the
    /// stream pump.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = Self {
            id: format!("conn-{}", uuid::Uuid::new_v4()),
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        };
        (conn, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark closed. The pump observes the dropped sender (or the flag)
    /// and terminates.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Push a message toward the wire. Returns false when the stream is
    /// closed or the channel is full (a stalled reader).
    pub fn try_send(&self, message: Value) -> bool {
        if self.is_closed() {
            return false;
        }
        self.tx.try_send(message).is_ok()
    }
}

/// Per-client state tracked by the session manager.
pub struct Session {
    id: String,
    transport: TransportKind,
    request_context: RequestContext,
    created_at: DateTime<Utc>,
    last_accessed_ms: AtomicI64,
    metadata: RwLock<HashMap<String, Value>>,
    streaming: Mutex<Option<StreamingConnection>>,
}

impl Session {
    pub fn new(id: String, transport: TransportKind, request_context: RequestContext) -> Self {
        let now = Utc::now();
        Self {
            id,
            transport,
            request_context,
            created_at: now,
            last_accessed_ms: AtomicI64::new(now.timestamp_millis()),
            metadata: RwLock::new(HashMap::new()),
            streaming: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn request_context(&self) -> &RequestContext {
        &self.request_context
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_accessed_at(&self) -> DateTime<Utc> {
        let ms = self.last_accessed_ms.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(ms).single().unwrap_or(self.created_at)
    }

    /// Refresh the access clock. Concurrent touches may race; the
    /// eviction predicate only needs the clock to move forward.
    pub fn touch(&self) {
        self.last_accessed_ms
            .fetch_max(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        let last = self.last_accessed_ms.load(Ordering::Relaxed);
        let idle = Utc::now().timestamp_millis().saturating_sub(last);
        idle > timeout.as_millis() as i64
    }

    pub fn metadata_get(&self, key: &str) -> Option<Value> {
        self.metadata.read().get(key).cloned()
    }

    pub fn metadata_set(&self, key: impl Into<String>, value: Value) {
        self.metadata.write().insert(key.into(), value);
    }

    /// Bind a streaming connection, closing any previous one. A session
    /// carries at most one stream at a time.
    pub fn set_streaming(&self, conn: StreamingConnection) {
        let mut slot = self.streaming.lock();
        if let Some(previous) = slot.take() {
            debug!(
                session_id = %self.id,
                replaced = previous.id(),
                "Replacing streaming connection"
            );
            previous.close();
        }
        *slot = Some(conn);
    }

    /// Detach the streaming connection without closing it.
    pub fn take_streaming(&self) -> Option<StreamingConnection> {
        self.streaming.lock().take()
    }

    /// Close and detach the streaming connection, if any.
    pub fn close_streaming(&self) -> bool {
        match self.streaming.lock().take() {
            Some(conn) => {
                conn.close();
                true
            },
            None => false,
        }
    }

    pub fn has_streaming(&self) -> bool {
        self.streaming
            .lock()
            .as_ref()
            .map(|c| !c.is_closed())
            .unwrap_or(false)
    }

    /// Detach only if the live connection is the one named; a newer
    /// stream bound in the meantime is left alone.
    pub fn remove_streaming_if(&self, conn_id: &str) -> bool {
        let mut slot = self.streaming.lock();
        match slot.as_ref() {
            Some(conn) if conn.id() == conn_id => {
                if let Some(conn) = slot.take() {
                    conn.close();
                }
                true
            },
            _ => false,
        }
    }

    /// Push a message to this session's stream. On failure the
    /// connection is closed and detached so the next send does not hit
    /// a dead writer.
    pub fn send_streaming(&self, message: Value) -> bool {
        let mut slot = self.streaming.lock();
        match slot.as_ref() {
            Some(conn) => {
                if conn.try_send(message) {
                    true
                } else {
                    debug!(session_id = %self.id, "Streaming send failed, detaching connection");
                    if let Some(conn) = slot.take() {
                        conn.close();
                    }
                    false
                }
            },
            None => false,
        }
    }
}
