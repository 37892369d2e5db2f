//! JSON-RPC method routing wrapped in middleware hooks.
//!
//! The dispatcher is transport-agnostic: every transport hands it a
//! parsed request plus the session it arrived on and gets back an
//! optional response (notifications produce none). Capability
//! operations run inside their hook chains: generic `before_request`
//! hooks, the operation's `before_*` hooks, the handler, then
//! `after_*` / `on_*_error` and `after_response`.

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::{Handler, HandlerContext, McpServer};
use crate::error::{Error, Result};
use crate::middleware::{HookType, MiddlewareContext, OperationType};
use crate::session::Session;
use crate::types::{codes, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION};

pub struct Dispatcher;

impl Dispatcher {
    /// Route one message. Returns `None` for notifications and for
    /// unknown notification methods; every request with an id gets a
    /// reply.
    pub async fn dispatch(
        server: &Arc<McpServer>,
        session: &Arc<Session>,
        request: JsonRpcRequest,
    ) -> Option<JsonRpcResponse> {
        session.touch();

        let id = request.id.clone();
        let is_notification = request.is_notification();

        if request.jsonrpc != "2.0" {
            if is_notification {
                return None;
            }
            return Some(JsonRpcResponse::error(
                id,
                codes::INVALID_REQUEST,
                format!("unsupported jsonrpc version: {}", request.jsonrpc),
            ));
        }

        debug!(
            session_id = %session.id(),
            method = %request.method,
            notification = is_notification,
            "Dispatching request"
        );

        let outcome = Self::route(server, session, &request).await;

        match outcome {
            Ok(Some(result)) => {
                if is_notification {
                    None
                } else {
                    Some(JsonRpcResponse::success(id, result))
                }
            },
            // Methods that intentionally produce no reply.
            Ok(None) => None,
            Err(err) => {
                if is_notification {
                    warn!(method = %request.method, error = %err, "Notification handler failed");
                    return None;
                }
                Some(Self::error_response(server, id, err))
            },
        }
    }

    /// Serialize an error into a JSON-RPC reply. Internal errors are
    /// sanitized: the original message is logged, and echoed into
    /// `data` only when debug mode is on.
    fn error_response(server: &McpServer, id: Option<Value>, err: Error) -> JsonRpcResponse {
        let code = err.jsonrpc_code().unwrap_or(codes::INTERNAL_ERROR);

        if code == codes::INTERNAL_ERROR {
            error!(error = %err, "Internal error while handling request");
            if server.debug_errors() {
                return JsonRpcResponse::error_with_data(
                    id,
                    code,
                    "Internal error",
                    json!({"detail": err.to_string()}),
                );
            }
            return JsonRpcResponse::error(id, code, "Internal error");
        }

        JsonRpcResponse::error(id, code, err.to_string())
    }

    async fn route(
        server: &Arc<McpServer>,
        session: &Arc<Session>,
        request: &JsonRpcRequest,
    ) -> Result<Option<Value>> {
        let params = request.params.clone().unwrap_or_else(|| json!({}));

        match request.method.as_str() {
            "initialize" => {
                session.metadata_set("initialized", json!(true));
                Ok(Some(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": server.capabilities(),
                    "serverInfo": {
                        "name": server.name(),
                        "version": server.version(),
                    },
                })))
            },

            "ping" => Ok(Some(json!({}))),

            "logging/setLevel" => {
                let level = required_str(&params, "level")?;
                match level {
                    "debug" | "info" | "notice" | "warning" | "error" | "critical" | "alert"
                    | "emergency" => {
                        session.metadata_set("log_level", json!(level));
                        Ok(Some(json!({})))
                    },
                    other => Err(Error::InvalidParams(format!("unknown log level: {}", other))),
                }
            },

            "notifications/initialized" => {
                session.metadata_set("client_ready", json!(true));
                Ok(None)
            },

            // Unknown notifications are dropped, not errored.
            method if method.starts_with("notifications/") => {
                debug!(method, "Ignoring unhandled notification");
                Ok(None)
            },

            "tools/list" => Ok(Some(json!({"tools": server.list_tools()}))),

            "tools/call" => {
                let name = required_str(&params, "name")?.to_string();
                let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

                let (_descriptor, handler) = server
                    .tool(&name)
                    .ok_or_else(|| Error::NotFound(format!("tool '{}'", name)))?;

                let result = Self::run_wrapped(
                    server,
                    session,
                    OperationType::ToolCall,
                    &name,
                    arguments,
                    HookType::BeforeToolCall,
                    HookType::AfterToolCall,
                    HookType::OnToolError,
                    handler,
                )
                .await?;
                Ok(Some(result))
            },

            "resources/list" => Ok(Some(json!({"resources": server.list_resources()}))),

            "resources/read" => {
                let uri = required_str(&params, "uri")?.to_string();

                let (_descriptor, handler) = server
                    .resource(&uri)
                    .ok_or_else(|| Error::NotFound(format!("resource '{}'", uri)))?;

                let result = Self::run_wrapped(
                    server,
                    session,
                    OperationType::ResourceRead,
                    &uri,
                    params.clone(),
                    HookType::BeforeResourceRead,
                    HookType::AfterResourceRead,
                    HookType::OnResourceError,
                    handler,
                )
                .await?;
                Ok(Some(result))
            },

            "prompts/list" => Ok(Some(json!({"prompts": server.list_prompts()}))),

            "prompts/get" => {
                let name = required_str(&params, "name")?.to_string();

                let (_descriptor, handler) = server
                    .prompt(&name)
                    .ok_or_else(|| Error::NotFound(format!("prompt '{}'", name)))?;

                let result = Self::run_wrapped(
                    server,
                    session,
                    OperationType::PromptGet,
                    &name,
                    params.clone(),
                    HookType::BeforePromptGet,
                    HookType::AfterPromptGet,
                    HookType::OnPromptError,
                    handler,
                )
                .await?;
                Ok(Some(result))
            },

            "sampling/createMessage" => {
                let handler = server
                    .sampling_handler()
                    .ok_or_else(|| Error::Sampling("no sampling handler registered".into()))?;

                let result = Self::run_wrapped(
                    server,
                    session,
                    OperationType::Sampling,
                    "sampling/createMessage",
                    params.clone(),
                    HookType::BeforeSamplingRequest,
                    HookType::AfterSamplingResponse,
                    HookType::OnSamplingError,
                    handler,
                )
                .await?;
                Ok(Some(result))
            },

            other => Err(Error::MethodNotFound(other.to_string())),
        }
    }

    /// Run a capability handler inside its hook chains.
    #[allow(clippy::too_many_arguments)]
    async fn run_wrapped(
        server: &Arc<McpServer>,
        session: &Arc<Session>,
        op: OperationType,
        name: &str,
        params: Value,
        before: HookType,
        after: HookType,
        on_error: HookType,
        handler: Handler,
    ) -> Result<Value> {
        let middleware = server.middleware().clone();
        let mut ctx = MiddlewareContext::new(op, name, &params, Some(session.clone()));

        // Surface the transport-authenticated user to hook conditions.
        if let Some(user) = session.metadata_get("user") {
            ctx.metadata.insert("user".to_string(), user);
        }

        middleware.execute(HookType::BeforeRequest, &mut ctx).await;
        if let Some(message) = ctx.error.take() {
            return Err(Error::Middleware(message));
        }

        // The skip flag is scoped to a single chain.
        ctx.skip_remaining_hooks = false;
        middleware.execute(before, &mut ctx).await;
        if let Some(message) = ctx.error.take() {
            return Err(Error::Middleware(message));
        }

        // A before hook can short-circuit by binding a result.
        let outcome = match ctx.result.take() {
            Some(result) => Ok(result),
            None => {
                let handler_ctx = HandlerContext {
                    server: server.clone(),
                    session: session.clone(),
                };
                handler(handler_ctx, params).await
            },
        };

        match outcome {
            Ok(result) => {
                ctx.result = Some(result);
                ctx.skip_remaining_hooks = false;
                middleware.execute(after, &mut ctx).await;
                ctx.skip_remaining_hooks = false;
                middleware.execute(HookType::AfterResponse, &mut ctx).await;

                Ok(ctx.result.take().unwrap_or(Value::Null))
            },
            Err(err) => {
                ctx.error = Some(err.to_string());
                ctx.skip_remaining_hooks = false;
                middleware.execute(on_error, &mut ctx).await;
                Err(err)
            },
        }
    }
}

fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidParams(format!("missing required parameter: {}", key)))
}
