//! Streamable HTTP transport.
//!
//! All MCP traffic rides a single path (default `/mcp`): POST carries
//! client JSON-RPC requests, a long-lived GET opens the server-to-
//! client SSE stream (resumable via `Last-Event-ID`), DELETE terminates
//! the session. Sessions are identified by the `Mcp-Session-Id` header;
//! a POST without one creates a session and echoes the assigned id.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, instrument, warn};

use crate::browser::BrowserBridge;
use crate::config::Config;
use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::events::EventStore;
use crate::middleware::security::NormalizedRequest;
use crate::middleware::{HookType, MiddlewareContext, OperationType};
use crate::server::{Dispatcher, McpServer};
use crate::session::SessionManager;
use crate::transport::sse::StreamHandler;
use crate::transport::extract_request_id;
use crate::types::{codes, JsonRpcRequest, JsonRpcResponse, TransportKind};

pub const SESSION_ID_HEADER: &str = "mcp-session-id";
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub server: Arc<McpServer>,
    pub sessions: Arc<SessionManager>,
    pub streams: Arc<StreamHandler>,
    pub bridge: Option<Arc<BrowserBridge>>,
    pub config: Arc<Config>,
}

pub struct HttpStreamTransport {
    state: AppState,
    shutdown_tx: broadcast::Sender<()>,
    grace: Duration,
}

impl HttpStreamTransport {
    pub fn new(server: Arc<McpServer>, config: Arc<Config>) -> Self {
        let sessions = Arc::new(SessionManager::new(&config.session, TransportKind::HttpStream));
        let events = Arc::new(EventStore::new(config.events.max_events));
        let streams = Arc::new(StreamHandler::new(events, &config.sse));
        let bridge = if config.browser.enabled {
            Some(Arc::new(BrowserBridge::new(&config.browser)))
        } else {
            None
        };

        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            state: AppState {
                server,
                sessions,
                streams,
                bridge,
                config: config.clone(),
            },
            shutdown_tx,
            grace: Duration::from_secs(config.server.shutdown_grace_secs),
        }
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.state.sessions
    }

    pub fn streams(&self) -> &Arc<StreamHandler> {
        &self.state.streams
    }

    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Build the router: health at `/`, the MCP path, and the browser
    /// bridge when enabled.
    pub fn build_router(&self) -> Router {
        let mcp_path = self.state.config.server.mcp_path.clone();

        let mut router = Router::new().route("/", get(health_check)).route(
            &mcp_path,
            get(handle_get).post(handle_post).delete(handle_delete),
        );

        if self.state.bridge.is_some() {
            router = router.merge(crate::browser::routes());
        }

        router
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve until a shutdown signal arrives, then close sessions and
    /// drain in-flight handlers inside the grace window.
    pub async fn run(&self) -> Result<()> {
        let addr = format!(
            "{}:{}",
            self.state.config.server.host, self.state.config.server.port
        )
        .parse::<SocketAddr>()
        .map_err(|e| Error::Config(format!("Invalid address: {}", e)))?;

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Server(format!("Failed to bind {}: {}", addr, e)))?;

        info!("HTTP stream transport listening on {}", addr);

        let cleanup_task = self
            .state
            .sessions
            .spawn_cleanup_task(self.shutdown_tx.subscribe());

        let state = self.state.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let graceful = async move {
            let _ = shutdown_rx.recv().await;
            info!("Shutting down HTTP stream transport");
            // Closing sessions ends their SSE bodies, which lets the
            // graceful drain below actually finish.
            if let Some(bridge) = &state.bridge {
                bridge.clear();
            }
            state.sessions.cleanup_all();
        };

        let serve = axum::serve(listener, self.build_router()).with_graceful_shutdown(graceful);
        let serve = serve.into_future();
        tokio::pin!(serve);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::select! {
            result = &mut serve => {
                result.map_err(|e| Error::Server(format!("Server error: {}", e)))?;
            }
            _ = shutdown_rx.recv() => {
                match tokio::time::timeout(self.grace, serve).await {
                    Ok(result) => {
                        result.map_err(|e| Error::Server(format!("Server error: {}", e)))?;
                    },
                    Err(_) => {
                        warn!(grace_secs = self.grace.as_secs(), "Drain window elapsed, forcing shutdown");
                    },
                }
            }
        }

        if let Some(task) = cleanup_task {
            task.abort();
        }

        info!("HTTP stream transport stopped");
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Push a notification to one session's SSE stream.
    pub fn send_notification(&self, session_id: &str, method: &str, params: Option<Value>) -> bool {
        let message = notification_value(method, params);
        match self.state.sessions.get(session_id) {
            Some(session) => self.state.streams.send_to_session(&session, &message),
            None => false,
        }
    }

    /// Push a notification to every session with a live stream;
    /// returns the recipient count.
    pub fn broadcast_notification(&self, method: &str, params: Option<Value>) -> usize {
        self.state.sessions.broadcast(notification_value(method, params))
    }
}

fn notification_value(method: &str, params: Option<Value>) -> Value {
    serde_json::to_value(JsonRpcRequest::notification(method, params))
        .unwrap_or_else(|_| json!({"jsonrpc": "2.0", "method": method}))
}

/// Fold an axum header map into the lowercase string map the security
/// and context layers use.
pub fn normalize_request(method: &str, path: &str, headers: &HeaderMap) -> NormalizedRequest {
    NormalizedRequest {
        method: method.to_string(),
        path: path.to_string(),
        headers: lowercase_headers(headers),
        params: HashMap::new(),
    }
}

fn lowercase_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

fn missing_session_header() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": "Missing Mcp-Session-Id header"})),
    )
        .into_response()
}

fn auth_failure(outcome: &crate::middleware::security::SecurityOutcome) -> Response {
    (
        outcome.status,
        Json(json!({
            "error": {
                "code": outcome.code,
                "message": outcome.message,
            }
        })),
    )
        .into_response()
}

/// `POST /mcp`: one JSON-RPC request in, one reply out (or 202 for a
/// notification). The assigned session id is echoed on every reply.
#[instrument(skip_all)]
async fn handle_post(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let security = state.server.security();
    let mcp_path = state.config.server.mcp_path.clone();

    let mut user = None;
    if security.auth_required() {
        let mut normalized = normalize_request("POST", &mcp_path, &headers);
        normalized.params = query.clone();

        let outcome = security.process_request(&normalized, None, None);
        if !outcome.success {
            return auth_failure(&outcome);
        }
        user = outcome.user;
    }

    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            let raw = String::from_utf8_lossy(&body);
            let id = extract_request_id(&raw);
            debug!(error = %err, "POST body failed to parse");

            let mut ctx =
                MiddlewareContext::new(OperationType::Request, "parse", &Value::Null, None);
            ctx.error = Some(err.to_string());
            state
                .server
                .middleware()
                .execute(HookType::OnTransportError, &mut ctx)
                .await;

            let reply =
                JsonRpcResponse::error(id, codes::PARSE_ERROR, format!("Parse error: {}", err));
            return (StatusCode::BAD_REQUEST, Json(reply)).into_response();
        },
    };

    let request_id = value.get("id").cloned();
    let request: JsonRpcRequest = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(err) => {
            let reply = JsonRpcResponse::error(
                request_id,
                codes::INVALID_REQUEST,
                format!("Invalid request: {}", err),
            );
            return (StatusCode::BAD_REQUEST, Json(reply)).into_response();
        },
    };

    let presented_id = header_str(&headers, SESSION_ID_HEADER).map(str::to_string);
    let request_context = RequestContext::new(
        "POST",
        &mcp_path,
        lowercase_headers(&headers),
        query,
        TransportKind::HttpStream,
        None,
    );
    // A stale or unknown presented id is not resurrected: the client
    // gets a fresh session and sees the new id in the echo header.
    let session = match presented_id.and_then(|id| state.sessions.get(&id)) {
        Some(session) => session,
        None => state.sessions.create(None, Some(request_context)),
    };

    if let Some(user) = user {
        session.metadata_set("user", user.to_value());
    }

    let session_header = [(SESSION_ID_HEADER, session.id().to_string())];

    match Dispatcher::dispatch(&state.server, &session, request).await {
        // Notifications produce no reply body.
        None => (StatusCode::ACCEPTED, session_header).into_response(),
        Some(reply) => {
            let status = match &reply.error {
                Some(error) => Error::status_for_code(error.code),
                None => StatusCode::OK,
            };
            (status, session_header, Json(reply)).into_response()
        },
    }
}

/// `GET /mcp`: open the session's SSE stream, replaying from
/// `Last-Event-ID` when supplied.
#[instrument(skip_all)]
async fn handle_get(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let session_id = match header_str(&headers, SESSION_ID_HEADER) {
        Some(id) => id.to_string(),
        None => return missing_session_header(),
    };

    let session = match state.sessions.get(&session_id) {
        Some(session) => session,
        None => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "Unknown session"})),
            )
                .into_response();
        },
    };

    let last_event_id = header_str(&headers, LAST_EVENT_ID_HEADER).map(str::to_string);
    debug!(session_id = %session_id, resumed = last_event_id.is_some(), "Opening SSE stream");

    state.streams.open_stream(session, last_event_id)
}

/// `DELETE /mcp`: terminate the session. 204 on success, 404 when the
/// id is unknown, 400 without the header.
#[instrument(skip_all)]
async fn handle_delete(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let session_id = match header_str(&headers, SESSION_ID_HEADER) {
        Some(id) => id.to_string(),
        None => return missing_session_header(),
    };

    if state.sessions.terminate(&session_id) {
        info!(session_id = %session_id, "Session deleted by client");
        StatusCode::NO_CONTENT.into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Unknown session"})),
        )
            .into_response()
    }
}
