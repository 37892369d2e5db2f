//! End-to-end scenarios over the streamable HTTP transport
//!
//! Drives the axum router directly with tower's oneshot: session
//! establishment, SSE resume, termination, the auth gate, and the
//! JSON-RPC code to HTTP status mapping.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use manifold_mcp::config::Config;
use manifold_mcp::error::Error;
use manifold_mcp::server::{handler_fn, McpServer, ToolDescriptor};
use manifold_mcp::transport::http::{HttpStreamTransport, SESSION_ID_HEADER};
use manifold_mcp::types::codes;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn make_transport(mutate: impl FnOnce(&mut Config)) -> HttpStreamTransport {
    let mut config = Config::default();
    mutate(&mut config);
    let config = Arc::new(config);
    let server = Arc::new(McpServer::new(&config));
    HttpStreamTransport::new(server, config)
}

fn post(body: Value, session_id: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json");
    if let Some(id) = session_id {
        builder = builder.header(SESSION_ID_HEADER, id);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn initialize_body(id: i64) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "initialize",
        "params": {
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {"name": "c", "version": "1"}
        }
    })
}

/// One SSE frame: id, optional event type, data payload.
fn parse_frame(frame: &str) -> (Option<String>, Option<String>, String) {
    let mut id = None;
    let mut event = None;
    let mut data = Vec::new();
    for line in frame.lines() {
        if let Some(rest) = line.strip_prefix("id: ") {
            id = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("event: ") {
            event = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("data: ") {
            data.push(rest.to_string());
        }
    }
    (id, event, data.join("\n"))
}

async fn next_frame(body: &mut Body) -> String {
    let frame = tokio::time::timeout(std::time::Duration::from_secs(2), body.frame())
        .await
        .expect("timed out waiting for SSE frame")
        .unwrap()
        .unwrap();
    String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap()
}

/// POST initialize establishes a session.
#[tokio::test]
async fn test_initialize_establishes_session() {
    let transport = make_transport(|_| {});
    let router = transport.build_router();

    let response = router.oneshot(post(initialize_body(1), None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let session_id = response
        .headers()
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .expect("session id header")
        .to_string();
    assert!(!session_id.is_empty());

    let reply = body_json(response).await;
    assert_json_diff::assert_json_include!(
        actual: &reply,
        expected: json!({"jsonrpc": "2.0", "id": 1})
    );
    assert!(reply["result"]["protocolVersion"].is_string());
    assert!(reply.get("error").is_none());
}

/// SSE replay: after two broadcasts, a reconnect with
/// Last-Event-ID of the first event replays exactly the second, then
/// the connection event, then live traffic.
#[tokio::test]
async fn test_sse_resume_replays_suffix() {
    let transport = make_transport(|_| {});
    let router = transport.build_router();

    // Establish a session.
    let response = router
        .clone()
        .oneshot(post(initialize_body(1), None))
        .await
        .unwrap();
    let session_id = response
        .headers()
        .get(SESSION_ID_HEADER)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    // Open the stream and consume the connection event.
    let stream = router
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/mcp")
                .header(SESSION_ID_HEADER, &session_id)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(stream.status(), StatusCode::OK);
    assert_eq!(
        stream.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    let mut body = stream.into_body();
    let (_, event, _) = parse_frame(&next_frame(&mut body).await);
    assert_eq!(event.as_deref(), Some("connection"));

    // Server pushes A then B.
    assert_eq!(
        transport.broadcast_notification("notifications/message", Some(json!({"n": "A"}))),
        1
    );
    assert_eq!(
        transport.broadcast_notification("notifications/message", Some(json!({"n": "B"}))),
        1
    );

    let (id_a, _, data_a) = parse_frame(&next_frame(&mut body).await);
    assert!(data_a.contains("\"n\":\"A\""));
    let (_, _, data_b) = parse_frame(&next_frame(&mut body).await);
    assert!(data_b.contains("\"n\":\"B\""));
    drop(body);

    // Reconnect after A: the stream begins with exactly B, then the
    // connection event.
    let resumed = router
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/mcp")
                .header(SESSION_ID_HEADER, &session_id)
                .header("last-event-id", id_a.unwrap())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let mut body = resumed.into_body();
    let (_, event, data) = parse_frame(&next_frame(&mut body).await);
    assert_eq!(event.as_deref(), Some("message"));
    assert!(data.contains("\"n\":\"B\""), "replay starts at B, got {}", data);

    let (_, event, _) = parse_frame(&next_frame(&mut body).await);
    assert_eq!(event.as_deref(), Some("connection"));

    // Live events follow the replay.
    transport.broadcast_notification("notifications/message", Some(json!({"n": "C"})));
    let (_, _, data) = parse_frame(&next_frame(&mut body).await);
    assert!(data.contains("\"n\":\"C\""));
}

/// DELETE terminates the session; the old id is not resurrected.
#[tokio::test]
async fn test_delete_terminates_and_post_reassigns() {
    let transport = make_transport(|_| {});
    let router = transport.build_router();

    let response = router
        .clone()
        .oneshot(post(initialize_body(1), None))
        .await
        .unwrap();
    let old_id = response
        .headers()
        .get(SESSION_ID_HEADER)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    // Attach a stream so termination has something to close.
    let stream = router
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/mcp")
                .header(SESSION_ID_HEADER, &old_id)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let session = transport.sessions().get(&old_id).unwrap();
    assert!(session.has_streaming());

    let deleted = router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/mcp")
                .header(SESSION_ID_HEADER, &old_id)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);
    assert!(!session.has_streaming(), "server closed the SSE connection");
    drop(stream);

    // Same id on a new POST: a different session id comes back.
    let response = router
        .clone()
        .oneshot(post(initialize_body(2), Some(&old_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let new_id = response
        .headers()
        .get(SESSION_ID_HEADER)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_ne!(new_id, old_id);
}

/// The auth gate on POST /mcp.
#[tokio::test]
async fn test_api_key_gate() {
    let transport = make_transport(|config| {
        config.auth.required = true;
        config.auth.strategy = "api_key".to_string();
        config.auth.api_keys = vec!["good-key".to_string()];
    });
    let router = transport.build_router();

    let denied = router.clone().oneshot(post(initialize_body(1), None)).await.unwrap();
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(denied).await;
    assert_eq!(body["error"]["message"], "Authentication required");
    assert_eq!(body["error"]["code"], "AUTHENTICATION_REQUIRED");

    let mut request = post(initialize_body(1), None);
    request
        .headers_mut()
        .insert("x-api-key", "good-key".parse().unwrap());
    let allowed = router.clone().oneshot(request).await.unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);
}

/// Every JSON-RPC error code maps to its HTTP status.
#[tokio::test]
async fn test_jsonrpc_code_to_http_status_mapping() {
    let transport = make_transport(|_| {});
    transport_register_fixtures(&transport);
    let router = transport.build_router();

    // Parse error: -32700 -> 400.
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .header("content-type", "application/json")
                .body(Body::from("{broken"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"]["code"], codes::PARSE_ERROR);

    // Invalid request: -32600 -> 400.
    let response = router
        .clone()
        .oneshot(post(json!({"jsonrpc": "2.0", "id": 1}), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_json(response).await["error"]["code"],
        codes::INVALID_REQUEST
    );

    // Method not found: -32601 -> 404.
    let response = router
        .clone()
        .oneshot(post(
            json!({"jsonrpc": "2.0", "id": 1, "method": "nope"}),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        body_json(response).await["error"]["code"],
        codes::METHOD_NOT_FOUND
    );

    // Invalid params: -32602 -> 400.
    let response = router
        .clone()
        .oneshot(post(
            json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {}}),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_json(response).await["error"]["code"],
        codes::INVALID_PARAMS
    );

    // Internal: -32603 -> 500.
    let response = router
        .clone()
        .oneshot(post(
            json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call",
                   "params": {"name": "boom", "arguments": {}}}),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        body_json(response).await["error"]["code"],
        codes::INTERNAL_ERROR
    );

    // Not found: -32001 -> 404.
    let response = router
        .clone()
        .oneshot(post(
            json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call",
                   "params": {"name": "ghost"}}),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"]["code"], codes::NOT_FOUND);

    // Generic server error range -> 500.
    assert_eq!(
        Error::status_for_code(-32055),
        StatusCode::INTERNAL_SERVER_ERROR
    );
}

fn transport_register_fixtures(transport: &HttpStreamTransport) {
    let state = transport.state();
    state.server.register_tool(
        ToolDescriptor {
            name: "boom".to_string(),
            description: None,
            input_schema: json!({"type": "object"}),
        },
        handler_fn(|_ctx, _args| async {
            Err(manifold_mcp::Error::Internal("handler blew up".into()))
        }),
    );
}

/// Requests on a live session keep it alive; tools run through the
/// registered handler.
#[tokio::test]
async fn test_tool_call_over_http() {
    let transport = make_transport(|_| {});
    let state = transport.state();
    state.server.register_tool(
        ToolDescriptor {
            name: "sum".to_string(),
            description: Some("adds two numbers".to_string()),
            input_schema: json!({"type": "object"}),
        },
        handler_fn(|_ctx, args| async move {
            let a = args["a"].as_i64().unwrap_or(0);
            let b = args["b"].as_i64().unwrap_or(0);
            Ok(json!({"sum": a + b}))
        }),
    );
    let router = transport.build_router();

    let response = router
        .clone()
        .oneshot(post(initialize_body(1), None))
        .await
        .unwrap();
    let session_id = response
        .headers()
        .get(SESSION_ID_HEADER)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    let response = router
        .clone()
        .oneshot(post(
            json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call",
                   "params": {"name": "sum", "arguments": {"a": 2, "b": 3}}}),
            Some(&session_id),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    // Same session continues; no new session materialized.
    assert_eq!(transport.sessions().session_count(), 1);
    let reply = body_json(response).await;
    assert_eq!(reply["result"]["sum"], 5);
}
