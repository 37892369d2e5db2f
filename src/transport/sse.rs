//! Per-session SSE stream handling.
//!
//! Each open stream replays missed events (when the client reconnects
//! with `Last-Event-ID`), announces itself with a synthetic
//! `connection` event, then pumps the session's outbound channel to
//! the wire as `message` events with fresh event-store ids. A
//! keep-alive task emits `heartbeat` events until the stream closes.
//!
//! Only stored `message` events carry an `id:` field. EventSource
//! clients adopt the id of any received event as their Last-Event-ID,
//! so an id on a keep-alive would advance the resume cursor past the
//! replay window; connection and heartbeat frames are therefore
//! emitted id-less and never move the cursor.
//!
//! Ordering: replayed events strictly precede live events, and the
//! live stream preserves enqueue order.

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use serde_json::{json, Value};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::SseConfig;
use crate::events::{Event, EventStore};
use crate::session::{Session, StreamingConnection};

/// Adapts the wire channel into a response body stream.
struct ByteStream {
    rx: mpsc::Receiver<Bytes>,
}

impl Stream for ByteStream {
    type Item = std::result::Result<Bytes, std::convert::Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|chunk| chunk.map(Ok))
    }
}

pub struct StreamHandler {
    event_store: Arc<EventStore>,
    heartbeat_interval: Duration,
    channel_capacity: usize,
}

impl StreamHandler {
    pub fn new(event_store: Arc<EventStore>, config: &SseConfig) -> Self {
        Self {
            event_store,
            heartbeat_interval: Duration::from_secs(config.heartbeat_secs),
            channel_capacity: config.channel_capacity,
        }
    }

    pub fn event_store(&self) -> &Arc<EventStore> {
        &self.event_store
    }

    /// Open a stream for `session`, becoming its single streaming
    /// connection (any previous stream is closed). Returns the HTTP
    /// response whose body is the live SSE stream.
    pub fn open_stream(&self, session: Arc<Session>, last_event_id: Option<String>) -> Response {
        let (conn, outbound_rx) = StreamingConnection::channel(self.channel_capacity);
        let conn_id = conn.id().to_string();
        session.set_streaming(conn);

        let detach_session = session.clone();
        let detach_id = conn_id.clone();
        self.spawn_stream(
            session.id().to_string(),
            conn_id,
            outbound_rx,
            last_event_id,
            Box::new(move || {
                detach_session.remove_streaming_if(&detach_id);
            }),
        )
    }

    /// Legacy shared-session mode: attach one more client to the
    /// single shared session. Every client gets its own stream over
    /// the same event window.
    pub fn open_legacy_stream(
        &self,
        manager: &Arc<crate::session::legacy::LegacySseSessionManager>,
        last_event_id: Option<String>,
    ) -> Response {
        let (conn, outbound_rx) = StreamingConnection::channel(self.channel_capacity);
        let client_id = manager.add_client(conn);
        let session_id = manager.session().id().to_string();

        let detach_manager = manager.clone();
        let detach_id = client_id.clone();
        self.spawn_stream(
            session_id,
            client_id,
            outbound_rx,
            last_event_id,
            Box::new(move || {
                detach_manager.remove_client(&detach_id);
            }),
        )
    }

    fn spawn_stream(
        &self,
        session_id: String,
        conn_id: String,
        outbound_rx: mpsc::Receiver<Value>,
        last_event_id: Option<String>,
        on_detach: Box<dyn FnOnce() + Send + Sync>,
    ) -> Response {
        let replay = self.event_store.get_after(last_event_id.as_deref());
        if let Some(last_id) = &last_event_id {
            debug!(
                session_id = %session_id,
                last_event_id = %last_id,
                replayed = replay.len(),
                "Resuming SSE stream"
            );
        }

        let (wire_tx, wire_rx) = mpsc::channel::<Bytes>(self.channel_capacity);

        let pump = StreamPump {
            event_store: self.event_store.clone(),
            session_id,
            conn_id,
            outbound_rx,
            wire_tx,
            heartbeat_interval: self.heartbeat_interval,
            on_detach: Some(on_detach),
        };
        tokio::spawn(pump.run(replay));

        let mut response = Response::new(Body::from_stream(ByteStream { rx: wire_rx }));
        *response.status_mut() = StatusCode::OK;
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/event-stream"),
        );
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Last-Event-ID"),
        );

        response
    }

    /// Push a message to a session's live stream. Returns false when
    /// the session has no stream, the connection is closed, or the
    /// writer backed up; the dead connection is detached on failure.
    pub fn send_to_session(&self, session: &Session, message: &Value) -> bool {
        let delivered = session.send_streaming(message.clone());
        if !delivered {
            debug!(session_id = %session.id(), "send_to_session failed, no live stream");
        }
        delivered
    }
}

/// Moves events from the session's outbound channel (plus replay and
/// heartbeats) onto the wire. Exits when the peer disconnects or the
/// connection is closed, detaching itself from the session.
struct StreamPump {
    event_store: Arc<EventStore>,
    session_id: String,
    conn_id: String,
    outbound_rx: mpsc::Receiver<Value>,
    wire_tx: mpsc::Sender<Bytes>,
    heartbeat_interval: Duration,
    on_detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl StreamPump {
    async fn run(mut self, replay: Vec<Event>) {
        // Replay strictly precedes everything produced live.
        for event in replay {
            if !self.write(&event).await {
                self.detach();
                return;
            }
        }

        let connected = json!({
            "sessionId": self.session_id,
            "status": "connected",
        });
        if !self.write_control("connection", &connected.to_string()).await {
            self.detach();
            return;
        }

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                outbound = self.outbound_rx.recv() => {
                    match outbound {
                        Some(message) => {
                            // Live messages are persisted so a
                            // reconnect can replay them.
                            let data = message.to_string();
                            let id = self.event_store.store(data.clone(), Some("message".to_string()));
                            let event = Event {
                                id,
                                event_type: Some("message".to_string()),
                                data,
                                timestamp: Utc::now(),
                            };
                            if !self.write(&event).await {
                                break;
                            }
                        },
                        // Connection closed or replaced; stop cleanly.
                        None => {
                            debug!(session_id = %self.session_id, "Outbound channel closed");
                            break;
                        },
                    }
                }
                _ = heartbeat.tick() => {
                    let data = json!({"timestamp": Utc::now().to_rfc3339()}).to_string();
                    if !self.write_control("heartbeat", &data).await {
                        break;
                    }
                }
            }
        }

        self.detach();
    }

    /// Write one stored event frame; false means the peer went away.
    async fn write(&self, event: &Event) -> bool {
        self.write_raw(event.to_sse()).await
    }

    /// Write a control frame (connection, heartbeat). Control frames
    /// carry no `id:` field, so receiving one never changes the
    /// client's Last-Event-ID.
    async fn write_control(&self, event_type: &str, data: &str) -> bool {
        self.write_raw(format!("event: {}\ndata: {}\n\n", event_type, data)).await
    }

    async fn write_raw(&self, frame: String) -> bool {
        match self.wire_tx.send(Bytes::from(frame)).await {
            Ok(()) => true,
            Err(_) => {
                debug!(
                    session_id = %self.session_id,
                    "SSE peer disconnected"
                );
                false
            },
        }
    }

    fn detach(&mut self) {
        if let Some(detach) = self.on_detach.take() {
            detach();
            debug!(
                session_id = %self.session_id,
                conn_id = %self.conn_id,
                "Streaming connection detached"
            );
        } else {
            warn!(
                session_id = %self.session_id,
                conn_id = %self.conn_id,
                "Stream pump detached twice"
            );
        }
    }
}
