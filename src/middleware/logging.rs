//! Built-in middlewares: structured operation logging and timing.
//!
//! Registered out of the box by callers that want visibility into the
//! hook pipeline without writing their own middleware. Both are
//! stateless and safe to share across every hook type.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use super::{HookError, HookType, Middleware, MiddlewareContext};

/// Logs the start, completion, and failure of every operation it is
/// registered for. Before hooks record a start timestamp in the
/// context metadata; after hooks log the elapsed time against it.
#[derive(Default)]
pub struct LoggingMiddleware;

impl LoggingMiddleware {
    pub fn new() -> Self {
        Self
    }
}

const STARTED_AT_KEY: &str = "logging.started_at_ms";

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    async fn call(
        &self,
        hook: HookType,
        ctx: &mut MiddlewareContext,
    ) -> std::result::Result<(), HookError> {
        let operation = ctx.operation_name().to_string();
        let op_type = ctx.operation_type().as_str();

        match hook {
            HookType::BeforeToolCall
            | HookType::BeforeResourceRead
            | HookType::BeforePromptGet
            | HookType::BeforeSamplingRequest
            | HookType::BeforeRequest
            | HookType::BeforeAuthentication => {
                ctx.metadata.insert(
                    STARTED_AT_KEY.to_string(),
                    json!(Utc::now().timestamp_millis()),
                );
                debug!(
                    operation = %operation,
                    operation_type = op_type,
                    user = ctx.user_id().unwrap_or("anonymous"),
                    "Operation started"
                );
            },
            HookType::AfterToolCall
            | HookType::AfterResourceRead
            | HookType::AfterPromptGet
            | HookType::AfterSamplingResponse
            | HookType::AfterResponse
            | HookType::AfterAuthentication => {
                info!(
                    operation = %operation,
                    operation_type = op_type,
                    elapsed_ms = self.elapsed_ms(ctx),
                    "Operation completed"
                );
            },
            HookType::OnToolError
            | HookType::OnResourceError
            | HookType::OnPromptError
            | HookType::OnSamplingError
            | HookType::OnTransportError => {
                warn!(
                    operation = %operation,
                    operation_type = op_type,
                    elapsed_ms = self.elapsed_ms(ctx),
                    error = ctx.error.as_deref().unwrap_or("unknown"),
                    "Operation failed"
                );
            },
        }

        Ok(())
    }
}

impl LoggingMiddleware {
    fn elapsed_ms(&self, ctx: &MiddlewareContext) -> i64 {
        ctx.metadata
            .get(STARTED_AT_KEY)
            .and_then(serde_json::Value::as_i64)
            .map(|started| Utc::now().timestamp_millis().saturating_sub(started))
            .unwrap_or(0)
    }
}

/// Accumulates per-operation call counts and total elapsed time into
/// the context metadata under `timing`. Useful for smoke-testing hook
/// wiring and as a template for real metrics middlewares.
#[derive(Default)]
pub struct TimingMiddleware;

impl TimingMiddleware {
    pub fn new() -> Self {
        Self
    }
}

const TIMING_START_KEY: &str = "timing.started_at_ms";

#[async_trait]
impl Middleware for TimingMiddleware {
    fn name(&self) -> &str {
        "timing"
    }

    async fn call(
        &self,
        hook: HookType,
        ctx: &mut MiddlewareContext,
    ) -> std::result::Result<(), HookError> {
        let now = Utc::now().timestamp_millis();

        if hook.as_str().starts_with("before_") {
            ctx.metadata.insert(TIMING_START_KEY.to_string(), json!(now));
            return Ok(());
        }

        let started = ctx
            .metadata
            .get(TIMING_START_KEY)
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(now);

        ctx.metadata.insert(
            "timing".to_string(),
            json!({
                "operation": ctx.operation_name(),
                "elapsed_ms": now.saturating_sub(started),
                "failed": ctx.error.is_some(),
            }),
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{MiddlewareManager, OperationType};
    use std::sync::Arc;

    fn ctx() -> MiddlewareContext {
        MiddlewareContext::new(OperationType::ToolCall, "echo", &json!({}), None)
    }

    #[tokio::test]
    async fn test_logging_middleware_stamps_start() {
        let manager = MiddlewareManager::new();
        manager.register_simple(
            Arc::new(LoggingMiddleware::new()),
            &[HookType::BeforeToolCall, HookType::AfterToolCall],
        );

        let mut context = ctx();
        manager.execute(HookType::BeforeToolCall, &mut context).await;
        assert!(context.metadata.contains_key(STARTED_AT_KEY));

        // The after hook logs without failing even when the clock
        // barely moved.
        let summary = manager.execute(HookType::AfterToolCall, &mut context).await;
        assert_eq!(summary.executed, 1);
        assert!(!summary.aborted);
    }

    #[tokio::test]
    async fn test_timing_middleware_records_result() {
        let manager = MiddlewareManager::new();
        manager.register_simple(
            Arc::new(TimingMiddleware::new()),
            &[HookType::BeforeToolCall, HookType::AfterToolCall],
        );

        let mut context = ctx();
        manager.execute(HookType::BeforeToolCall, &mut context).await;
        manager.execute(HookType::AfterToolCall, &mut context).await;

        let timing = context.metadata.get("timing").unwrap();
        assert_eq!(timing["operation"], "echo");
        assert_eq!(timing["failed"], false);
        assert!(timing["elapsed_ms"].as_i64().unwrap() >= 0);
    }

    #[tokio::test]
    async fn test_error_hook_logs_without_start() {
        // An error hook with no recorded start must not panic.
        let middleware = LoggingMiddleware::new();
        let mut context = ctx();
        context.error = Some("boom".to_string());

        middleware.call(HookType::OnToolError, &mut context).await.unwrap();
    }
}
