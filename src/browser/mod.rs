//! Browser-extension command bridge.
//!
//! Tool-facing endpoints enqueue commands and block until the
//! extension (an external poller) posts the result back. The extension
//! side is three endpoints: ping for liveness, poll to drain pending
//! commands, result to complete one. A tool call with no extension
//! connected fails fast with 503; a connected but silent extension
//! times out with 408.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::commands::{Command, CommandAction, CommandOutcome, CommandQueue};
use crate::config::BrowserBridgeConfig;
use crate::error::Error;
use crate::transport::http::AppState;

pub struct BrowserBridge {
    queue: Arc<CommandQueue>,
    /// Unix millis of the last extension ping; 0 means never.
    last_ping_ms: AtomicI64,
    command_timeout: Duration,
    liveness_window: Duration,
}

impl BrowserBridge {
    pub fn new(config: &BrowserBridgeConfig) -> Self {
        Self {
            queue: Arc::new(CommandQueue::new()),
            last_ping_ms: AtomicI64::new(0),
            command_timeout: Duration::from_secs(config.command_timeout_secs),
            liveness_window: Duration::from_secs(config.liveness_secs),
        }
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    pub fn record_ping(&self) {
        self.last_ping_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    /// The extension counts as connected while pings keep arriving
    /// inside the liveness window.
    pub fn is_connected(&self) -> bool {
        let last = self.last_ping_ms.load(Ordering::Acquire);
        if last == 0 {
            return false;
        }
        let idle = Utc::now().timestamp_millis().saturating_sub(last);
        idle <= self.liveness_window.as_millis() as i64
    }

    /// Enqueue a command and block for its result.
    pub async fn execute(
        &self,
        action: CommandAction,
        params: Value,
    ) -> crate::error::Result<CommandOutcome> {
        if !self.is_connected() {
            return Err(Error::ExtensionNotConnected);
        }

        let command = Command::new(action, params);
        let id = command.id;
        self.queue.enqueue(command);

        self.queue.wait_for_result(id, self.command_timeout).await
    }

    /// Drop queued work, e.g. at shutdown.
    pub fn clear(&self) {
        self.queue.clear();
    }
}

/// Routes mounted under `/browser`.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/browser/ping", post(handle_ping))
        .route("/browser/poll", get(handle_poll))
        .route("/browser/result", post(handle_result))
        .route("/browser/:action", post(handle_action))
}

fn bridge_of(state: &AppState) -> Result<Arc<BrowserBridge>, Response> {
    state.bridge.clone().ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Browser bridge disabled"})),
        )
            .into_response()
    })
}

async fn handle_ping(State(state): State<AppState>) -> Response {
    let bridge = match bridge_of(&state) {
        Ok(bridge) => bridge,
        Err(response) => return response,
    };

    let first_contact = !bridge.is_connected();
    bridge.record_ping();
    if first_contact {
        info!("Browser extension connected");
    }

    Json(json!({"status": "ok"})).into_response()
}

async fn handle_poll(State(state): State<AppState>) -> Response {
    let bridge = match bridge_of(&state) {
        Ok(bridge) => bridge,
        Err(response) => return response,
    };

    let commands = bridge.queue().drain_pending();
    if !commands.is_empty() {
        debug!(count = commands.len(), "Extension drained commands");
    }

    Json(json!({"commands": commands})).into_response()
}

#[derive(Debug, Deserialize)]
struct ResultBody {
    command_id: Uuid,
    success: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

async fn handle_result(State(state): State<AppState>, body: Bytes) -> Response {
    let bridge = match bridge_of(&state) {
        Ok(bridge) => bridge,
        Err(response) => return response,
    };

    let body: ResultBody = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("Invalid JSON body: {}", err)})),
            )
                .into_response();
        },
    };

    let outcome = CommandOutcome {
        command_id: body.command_id,
        success: body.success,
        result: body.result,
        error: body.error,
        completed_at: Utc::now(),
    };
    bridge.queue().complete(outcome);

    Json(json!({"status": "ok"})).into_response()
}

/// Tool-facing endpoints: `/browser/{navigate|click|type|snapshot|
/// screenshot|console|wait}`.
async fn handle_action(
    State(state): State<AppState>,
    Path(action): Path<String>,
    headers: axum::http::HeaderMap,
    body: Bytes,
) -> Response {
    let bridge = match bridge_of(&state) {
        Ok(bridge) => bridge,
        Err(response) => return response,
    };

    // Tool-facing calls pass through the same auth gate as /mcp.
    if state.server.security().auth_required() {
        let request = crate::transport::http::normalize_request(
            "POST",
            &format!("/browser/{}", action),
            &headers,
        );
        let outcome = state.server.security().process_request(&request, None, None);
        if !outcome.success {
            return (
                outcome.status,
                Json(json!({"error": {"code": outcome.code, "message": outcome.message}})),
            )
                .into_response();
        }
    }

    let action = match CommandAction::from_str(&action) {
        Some(action) => action,
        None => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": format!("Unknown browser action: {}", action)})),
            )
                .into_response();
        },
    };

    let params: Value = if body.is_empty() {
        json!({})
    } else {
        match serde_json::from_slice(&body) {
            Ok(params) => params,
            Err(err) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": format!("Invalid JSON body: {}", err)})),
                )
                    .into_response();
            },
        }
    };

    match bridge.execute(action, params).await {
        Ok(outcome) => Json(json!({
            "success": outcome.success,
            "result": outcome.result,
            "error": outcome.error,
        }))
        .into_response(),
        Err(Error::ExtensionNotConnected) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "Chrome extension not connected"})),
        )
            .into_response(),
        Err(Error::CommandTimeout(ms)) => {
            warn!(action = action.as_str(), timeout_ms = ms, "Browser command timed out");
            (
                StatusCode::REQUEST_TIMEOUT,
                Json(json!({"error": format!("Command timed out after {}ms", ms)})),
            )
                .into_response()
        },
        Err(err) => err.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge(liveness_secs: u64) -> BrowserBridge {
        BrowserBridge::new(&BrowserBridgeConfig {
            enabled: true,
            command_timeout_secs: 1,
            liveness_secs,
        })
    }

    #[test]
    fn test_liveness_window() {
        let bridge = bridge(30);
        assert!(!bridge.is_connected(), "never pinged");

        bridge.record_ping();
        assert!(bridge.is_connected());
    }

    #[test]
    fn test_stale_ping_disconnects() {
        let bridge = bridge(0);
        bridge.record_ping();
        std::thread::sleep(Duration::from_millis(5));
        assert!(!bridge.is_connected());
    }

    #[tokio::test]
    async fn test_execute_without_extension() {
        let bridge = bridge(30);
        let err = bridge.execute(CommandAction::Navigate, json!({"url": "https://x"})).await;
        assert!(matches!(err, Err(Error::ExtensionNotConnected)));
        // Nothing was queued.
        assert_eq!(bridge.queue().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_execute_roundtrip() {
        let bridge = Arc::new(bridge(30));
        bridge.record_ping();

        let worker = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                // Poll until the command shows up, then complete it.
                loop {
                    let drained = bridge.queue().drain_pending();
                    if let Some(command) = drained.into_iter().next() {
                        bridge
                            .queue()
                            .complete(CommandOutcome::ok(command.id, json!({"title": "Example"})));
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
        };

        let outcome = bridge
            .execute(CommandAction::Snapshot, json!({}))
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.result, Some(json!({"title": "Example"})));
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let bridge = bridge(30);
        bridge.record_ping();

        let err = bridge.execute(CommandAction::Wait, json!({"ms": 1})).await;
        assert!(matches!(err, Err(Error::CommandTimeout(_))));
    }
}
