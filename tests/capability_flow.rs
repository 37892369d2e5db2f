//! Capability operations end to end over HTTP
//!
//! Registers tools, resources, prompts, and a sampling handler on a
//! server, then drives the full POST path: listings, reads, gets,
//! sampling, and hook-chain interaction with the transport auth user.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use manifold_mcp::config::Config;
use manifold_mcp::middleware::{
    HookConditions, HookError, HookType, Middleware, MiddlewareContext,
};
use manifold_mcp::server::{
    handler_fn, McpServer, PromptDescriptor, ResourceDescriptor, ToolDescriptor,
};
use manifold_mcp::transport::http::{HttpStreamTransport, SESSION_ID_HEADER};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn populated_transport(mutate: impl FnOnce(&mut Config)) -> HttpStreamTransport {
    let mut config = Config::default();
    mutate(&mut config);
    let config = Arc::new(config);
    let server = Arc::new(McpServer::new(&config));

    server.register_tool(
        ToolDescriptor {
            name: "echo".to_string(),
            description: Some("echoes its arguments".to_string()),
            input_schema: json!({"type": "object"}),
        },
        handler_fn(|_ctx, args| async move { Ok(json!({"echoed": args})) }),
    );

    server.register_resource(
        ResourceDescriptor {
            uri: "memo://greeting".to_string(),
            name: "greeting".to_string(),
            description: None,
            mime_type: Some("text/plain".to_string()),
        },
        handler_fn(|_ctx, _args| async {
            Ok(json!({
                "contents": [{"uri": "memo://greeting", "text": "hello"}]
            }))
        }),
    );

    server.register_prompt(
        PromptDescriptor {
            name: "summarize".to_string(),
            description: Some("summarization prompt".to_string()),
            arguments: Some(json!([{"name": "text", "required": true}])),
        },
        handler_fn(|_ctx, args| async move {
            let text = args["arguments"]["text"].as_str().unwrap_or("").to_string();
            Ok(json!({
                "messages": [{
                    "role": "user",
                    "content": {"type": "text", "text": format!("Summarize: {}", text)}
                }]
            }))
        }),
    );

    server.set_sampling_handler(handler_fn(|_ctx, _args| async {
        Ok(json!({
            "role": "assistant",
            "content": {"type": "text", "text": "sampled"},
            "model": "stub-model"
        }))
    }));

    HttpStreamTransport::new(server, config)
}

fn rpc(body: Value, session_id: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json");
    if let Some(id) = session_id {
        builder = builder.header(SESSION_ID_HEADER, id);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn call(router: &axum::Router, body: Value) -> (StatusCode, Value) {
    let response = router.clone().oneshot(rpc(body, None)).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_initialize_advertises_registered_capabilities() {
    let transport = populated_transport(|_| {});
    let router = transport.build_router();

    let (status, reply) = call(
        &router,
        json!({"jsonrpc": "2.0", "id": 1, "method": "initialize",
               "params": {"protocolVersion": "2024-11-05", "capabilities": {}}}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let caps = &reply["result"]["capabilities"];
    assert!(caps.get("tools").is_some());
    assert!(caps.get("resources").is_some());
    assert!(caps.get("prompts").is_some());
    assert!(caps.get("sampling").is_some());
}

#[tokio::test]
async fn test_listings() {
    let transport = populated_transport(|_| {});
    let router = transport.build_router();

    let (_, reply) = call(
        &router,
        json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}),
    )
    .await;
    let tools = reply["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["name"], "echo");
    assert_eq!(tools[0]["inputSchema"]["type"], "object");

    let (_, reply) = call(
        &router,
        json!({"jsonrpc": "2.0", "id": 2, "method": "resources/list"}),
    )
    .await;
    let resources = reply["result"]["resources"].as_array().unwrap();
    assert_eq!(resources[0]["uri"], "memo://greeting");
    assert_eq!(resources[0]["mimeType"], "text/plain");

    let (_, reply) = call(
        &router,
        json!({"jsonrpc": "2.0", "id": 3, "method": "prompts/list"}),
    )
    .await;
    let prompts = reply["result"]["prompts"].as_array().unwrap();
    assert_eq!(prompts[0]["name"], "summarize");
}

#[tokio::test]
async fn test_resource_read_and_prompt_get() {
    let transport = populated_transport(|_| {});
    let router = transport.build_router();

    let (status, reply) = call(
        &router,
        json!({"jsonrpc": "2.0", "id": 1, "method": "resources/read",
               "params": {"uri": "memo://greeting"}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["result"]["contents"][0]["text"], "hello");

    let (status, reply) = call(
        &router,
        json!({"jsonrpc": "2.0", "id": 2, "method": "prompts/get",
               "params": {"name": "summarize", "arguments": {"text": "a long story"}}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        reply["result"]["messages"][0]["content"]["text"],
        "Summarize: a long story"
    );

    // Unknown resource is a not-found, not a server error.
    let (status, reply) = call(
        &router,
        json!({"jsonrpc": "2.0", "id": 3, "method": "resources/read",
               "params": {"uri": "memo://missing"}}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(reply["error"]["code"], -32001);
}

#[tokio::test]
async fn test_sampling_delegates_to_handler() {
    let transport = populated_transport(|_| {});
    let router = transport.build_router();

    let (status, reply) = call(
        &router,
        json!({"jsonrpc": "2.0", "id": 1, "method": "sampling/createMessage",
               "params": {"messages": [], "maxTokens": 16}}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["result"]["model"], "stub-model");
}

/// The user authenticated at the transport is visible to hook
/// conditions: an except_users guard blocks one key and passes
/// another.
#[tokio::test]
async fn test_transport_user_reaches_hook_conditions() {
    struct Tag;

    #[async_trait]
    impl Middleware for Tag {
        async fn after_tool_call(
            &self,
            ctx: &mut MiddlewareContext,
        ) -> Result<(), HookError> {
            let tag = json!(ctx.user_id().unwrap_or("anonymous"));
            if let Some(result) = ctx.result.as_mut() {
                result["tagged_for"] = tag;
            }
            Ok(())
        }
    }

    let transport = populated_transport(|config| {
        config.auth.required = true;
        config.auth.strategy = "api_key".to_string();
        config.auth.api_keys = vec!["alpha-key-1234".to_string(), "beta-key-5678".to_string()];
    });
    let state = transport.state();
    state.server.middleware().register(
        Arc::new(Tag),
        &[HookType::AfterToolCall],
        100,
        HookConditions {
            except_users: Some(vec!["api_key:beta-key".to_string()]),
            ..Default::default()
        },
    );
    let router = transport.build_router();

    let tool_call = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call",
                           "params": {"name": "echo", "arguments": {}}});

    // alpha is tagged.
    let mut request = rpc(tool_call.clone(), None);
    request
        .headers_mut()
        .insert("x-api-key", "alpha-key-1234".parse().unwrap());
    let response = router.clone().oneshot(request).await.unwrap();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let reply: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(reply["result"]["tagged_for"], "api_key:alpha-ke");

    // beta is excluded by the condition.
    let mut request = rpc(tool_call, None);
    request
        .headers_mut()
        .insert("x-api-key", "beta-key-5678".parse().unwrap());
    let response = router.clone().oneshot(request).await.unwrap();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let reply: Value = serde_json::from_slice(&bytes).unwrap();
    assert!(reply["result"].get("tagged_for").is_none());
}
