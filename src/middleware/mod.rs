//! Middleware pipeline primitives.
//!
//! Hooks attach to lifecycle points of an operation (before/after/
//! on-error for tool calls, resource reads, prompts, sampling, plus
//! generic transport and authentication points) and run in priority
//! order around the operation. The hook set is a closed enum so
//! dispatch is a match, not a method-name lookup; [`Middleware::call`]
//! remains as the umbrella fallback for middlewares that do not
//! override the specific methods.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::session::Session;

pub mod logging;
pub mod manager;
pub mod security;

pub use logging::{LoggingMiddleware, TimingMiddleware};
pub use manager::MiddlewareManager;

/// Lifecycle points hooks can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookType {
    BeforeToolCall,
    AfterToolCall,
    OnToolError,
    BeforeResourceRead,
    AfterResourceRead,
    OnResourceError,
    BeforePromptGet,
    AfterPromptGet,
    OnPromptError,
    BeforeSamplingRequest,
    AfterSamplingResponse,
    OnSamplingError,
    BeforeRequest,
    AfterResponse,
    OnTransportError,
    BeforeAuthentication,
    AfterAuthentication,
}

/// Kind of operation a context describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    ToolCall,
    ResourceRead,
    PromptGet,
    Sampling,
    Authentication,
    Request,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::ToolCall => "tool_call",
            OperationType::ResourceRead => "resource_read",
            OperationType::PromptGet => "prompt_get",
            OperationType::Sampling => "sampling",
            OperationType::Authentication => "authentication",
            OperationType::Request => "request",
        }
    }
}

impl HookType {
    /// Operation type a hook is scoped to. Generic transport hooks
    /// return `None` and match every operation.
    pub fn operation_type(&self) -> Option<OperationType> {
        match self {
            HookType::BeforeToolCall | HookType::AfterToolCall | HookType::OnToolError => {
                Some(OperationType::ToolCall)
            },
            HookType::BeforeResourceRead
            | HookType::AfterResourceRead
            | HookType::OnResourceError => Some(OperationType::ResourceRead),
            HookType::BeforePromptGet | HookType::AfterPromptGet | HookType::OnPromptError => {
                Some(OperationType::PromptGet)
            },
            HookType::BeforeSamplingRequest
            | HookType::AfterSamplingResponse
            | HookType::OnSamplingError => Some(OperationType::Sampling),
            HookType::BeforeAuthentication | HookType::AfterAuthentication => {
                Some(OperationType::Authentication)
            },
            HookType::BeforeRequest | HookType::AfterResponse | HookType::OnTransportError => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HookType::BeforeToolCall => "before_tool_call",
            HookType::AfterToolCall => "after_tool_call",
            HookType::OnToolError => "on_tool_error",
            HookType::BeforeResourceRead => "before_resource_read",
            HookType::AfterResourceRead => "after_resource_read",
            HookType::OnResourceError => "on_resource_error",
            HookType::BeforePromptGet => "before_prompt_get",
            HookType::AfterPromptGet => "after_prompt_get",
            HookType::OnPromptError => "on_prompt_error",
            HookType::BeforeSamplingRequest => "before_sampling_request",
            HookType::AfterSamplingResponse => "after_sampling_response",
            HookType::OnSamplingError => "on_sampling_error",
            HookType::BeforeRequest => "before_request",
            HookType::AfterResponse => "after_response",
            HookType::OnTransportError => "on_transport_error",
            HookType::BeforeAuthentication => "before_authentication",
            HookType::AfterAuthentication => "after_authentication",
        }
    }
}

impl std::fmt::Display for HookType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure modes of a hook.
#[derive(Debug, Error)]
pub enum HookError {
    /// Deliberate middleware failure. Always aborts the chain.
    #[error("Middleware error: {0}")]
    Middleware(String),

    /// Incidental failure. Logged and skipped unless the hook was
    /// registered with `critical: true`.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Mutable state threaded through a hook chain.
///
/// `params` is deep-copied at construction and frozen; hooks
/// communicate through `metadata`, `result` and `error`.
pub struct MiddlewareContext {
    operation_type: OperationType,
    operation_name: String,
    params: Value,
    pub session: Option<Arc<Session>>,
    pub metadata: HashMap<String, Value>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub skip_remaining_hooks: bool,
}

impl MiddlewareContext {
    pub fn new(
        operation_type: OperationType,
        operation_name: impl Into<String>,
        params: &Value,
        session: Option<Arc<Session>>,
    ) -> Self {
        Self {
            operation_type,
            operation_name: operation_name.into(),
            // Owned clone; callers keep their value, hooks cannot
            // mutate it.
            params: params.clone(),
            session,
            metadata: HashMap::new(),
            result: None,
            error: None,
            skip_remaining_hooks: false,
        }
    }

    pub fn operation_type(&self) -> OperationType {
        self.operation_type
    }

    pub fn operation_name(&self) -> &str {
        &self.operation_name
    }

    /// Frozen parameter snapshot.
    pub fn params(&self) -> &Value {
        &self.params
    }

    /// Authenticated user id, when an auth hook recorded one.
    pub fn user_id(&self) -> Option<&str> {
        self.metadata
            .get("user")
            .and_then(|u| u.get("id"))
            .and_then(Value::as_str)
    }
}

/// A middleware participates in one or more hook chains.
///
/// Override the specific methods for the hooks registered; the default
/// implementations fall through to [`Middleware::call`], the umbrella
/// entry point.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Umbrella handler: receives every hook the middleware did not
    /// override. The default is a no-op.
    async fn call(
        &self,
        hook: HookType,
        ctx: &mut MiddlewareContext,
    ) -> std::result::Result<(), HookError> {
        let _ = (hook, ctx);
        Ok(())
    }

    async fn before_tool_call(
        &self,
        ctx: &mut MiddlewareContext,
    ) -> std::result::Result<(), HookError> {
        self.call(HookType::BeforeToolCall, ctx).await
    }

    async fn after_tool_call(
        &self,
        ctx: &mut MiddlewareContext,
    ) -> std::result::Result<(), HookError> {
        self.call(HookType::AfterToolCall, ctx).await
    }

    async fn on_tool_error(
        &self,
        ctx: &mut MiddlewareContext,
    ) -> std::result::Result<(), HookError> {
        self.call(HookType::OnToolError, ctx).await
    }

    async fn before_resource_read(
        &self,
        ctx: &mut MiddlewareContext,
    ) -> std::result::Result<(), HookError> {
        self.call(HookType::BeforeResourceRead, ctx).await
    }

    async fn after_resource_read(
        &self,
        ctx: &mut MiddlewareContext,
    ) -> std::result::Result<(), HookError> {
        self.call(HookType::AfterResourceRead, ctx).await
    }

    async fn on_resource_error(
        &self,
        ctx: &mut MiddlewareContext,
    ) -> std::result::Result<(), HookError> {
        self.call(HookType::OnResourceError, ctx).await
    }

    async fn before_prompt_get(
        &self,
        ctx: &mut MiddlewareContext,
    ) -> std::result::Result<(), HookError> {
        self.call(HookType::BeforePromptGet, ctx).await
    }

    async fn after_prompt_get(
        &self,
        ctx: &mut MiddlewareContext,
    ) -> std::result::Result<(), HookError> {
        self.call(HookType::AfterPromptGet, ctx).await
    }

    async fn on_prompt_error(
        &self,
        ctx: &mut MiddlewareContext,
    ) -> std::result::Result<(), HookError> {
        self.call(HookType::OnPromptError, ctx).await
    }

    async fn before_sampling_request(
        &self,
        ctx: &mut MiddlewareContext,
    ) -> std::result::Result<(), HookError> {
        self.call(HookType::BeforeSamplingRequest, ctx).await
    }

    async fn after_sampling_response(
        &self,
        ctx: &mut MiddlewareContext,
    ) -> std::result::Result<(), HookError> {
        self.call(HookType::AfterSamplingResponse, ctx).await
    }

    async fn on_sampling_error(
        &self,
        ctx: &mut MiddlewareContext,
    ) -> std::result::Result<(), HookError> {
        self.call(HookType::OnSamplingError, ctx).await
    }

    async fn before_request(
        &self,
        ctx: &mut MiddlewareContext,
    ) -> std::result::Result<(), HookError> {
        self.call(HookType::BeforeRequest, ctx).await
    }

    async fn after_response(
        &self,
        ctx: &mut MiddlewareContext,
    ) -> std::result::Result<(), HookError> {
        self.call(HookType::AfterResponse, ctx).await
    }

    async fn on_transport_error(
        &self,
        ctx: &mut MiddlewareContext,
    ) -> std::result::Result<(), HookError> {
        self.call(HookType::OnTransportError, ctx).await
    }

    async fn before_authentication(
        &self,
        ctx: &mut MiddlewareContext,
    ) -> std::result::Result<(), HookError> {
        self.call(HookType::BeforeAuthentication, ctx).await
    }

    async fn after_authentication(
        &self,
        ctx: &mut MiddlewareContext,
    ) -> std::result::Result<(), HookError> {
        self.call(HookType::AfterAuthentication, ctx).await
    }
}

/// Registration-time conditions gating a hook per context.
#[derive(Debug, Clone, Default)]
pub struct HookConditions {
    pub only_operations: Option<Vec<String>>,
    pub except_operations: Option<Vec<String>>,
    pub only_users: Option<Vec<String>>,
    pub except_users: Option<Vec<String>>,
    /// Elevates incidental hook errors to chain-aborting.
    pub critical: bool,
}

impl HookConditions {
    /// Whether the hook should run for this context.
    pub fn matches(&self, ctx: &MiddlewareContext) -> bool {
        let name = ctx.operation_name();

        if let Some(only) = &self.only_operations {
            if !only.iter().any(|op| op == name) {
                return false;
            }
        }

        if let Some(except) = &self.except_operations {
            if except.iter().any(|op| op == name) {
                return false;
            }
        }

        let user = ctx.user_id();

        if let Some(only) = &self.only_users {
            match user {
                Some(id) if only.iter().any(|u| u == id) => {},
                _ => return false,
            }
        }

        if let Some(except) = &self.except_users {
            if let Some(id) = user {
                if except.iter().any(|u| u == id) {
                    return false;
                }
            }
        }

        true
    }
}
