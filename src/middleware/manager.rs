//! Hook registry and execution engine.
//!
//! Hooks execute in (priority, registration order): lower priority
//! first, ties broken by insertion. Registration normally happens at
//! startup but stays safe at runtime; execution snapshots the chain
//! under a read lock and runs outside it.

use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use super::{HookConditions, HookError, HookType, Middleware, MiddlewareContext};

#[derive(Clone)]
struct HookRegistration {
    middleware: Arc<dyn Middleware>,
    priority: i32,
    registration_index: u64,
    conditions: HookConditions,
}

/// Outcome of a chain execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub hook_type: &'static str,
    pub executed: usize,
    pub total: usize,
    pub aborted: bool,
}

#[derive(Default)]
pub struct MiddlewareManager {
    hooks: RwLock<HashMap<HookType, Vec<HookRegistration>>>,
    next_index: RwLock<u64>,
}

impl MiddlewareManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a middleware for a set of hook types. Default priority
    /// is 100; lower runs earlier.
    pub fn register(
        &self,
        middleware: Arc<dyn Middleware>,
        hook_types: &[HookType],
        priority: i32,
        conditions: HookConditions,
    ) {
        let mut hooks = self.hooks.write();
        let mut index = self.next_index.write();

        for hook_type in hook_types {
            let registration = HookRegistration {
                middleware: middleware.clone(),
                priority,
                registration_index: *index,
                conditions: conditions.clone(),
            };
            *index += 1;

            let chain = hooks.entry(*hook_type).or_default();
            chain.push(registration);
            chain.sort_by_key(|r| (r.priority, r.registration_index));

            debug!(
                middleware = middleware.name(),
                hook = hook_type.as_str(),
                priority,
                "Registered middleware hook"
            );
        }
    }

    /// Convenience wrapper with default priority and no conditions.
    pub fn register_simple(&self, middleware: Arc<dyn Middleware>, hook_types: &[HookType]) {
        self.register(middleware, hook_types, 100, HookConditions::default());
    }

    pub fn hook_count(&self, hook_type: HookType) -> usize {
        self.hooks.read().get(&hook_type).map(Vec::len).unwrap_or(0)
    }

    /// Run every matching hook of `hook_type` against the context.
    ///
    /// The chain stops early when a hook sets `skip_remaining_hooks`,
    /// or when a hook fails hard: a [`HookError::Middleware`] always
    /// aborts, an incidental error aborts only for `critical` hooks and
    /// is otherwise logged and skipped. Timing metadata is attached to
    /// the context afterwards.
    pub async fn execute(&self, hook_type: HookType, ctx: &mut MiddlewareContext) -> ExecutionSummary {
        // Snapshot so registrations made mid-flight do not shift the
        // chain under us.
        let chain: Vec<HookRegistration> = self
            .hooks
            .read()
            .get(&hook_type)
            .cloned()
            .unwrap_or_default();

        let total = chain.len();
        let started = Instant::now();
        let mut executed = 0;
        let mut aborted = false;

        for registration in &chain {
            if ctx.skip_remaining_hooks {
                debug!(
                    hook = hook_type.as_str(),
                    executed, "Remaining hooks skipped by context flag"
                );
                break;
            }

            // Scoped hooks only run for their own operation type.
            if let Some(op) = hook_type.operation_type() {
                if op != ctx.operation_type() {
                    continue;
                }
            }

            if !registration.conditions.matches(ctx) {
                continue;
            }

            executed += 1;
            let outcome = Self::dispatch(&*registration.middleware, hook_type, ctx).await;

            match outcome {
                Ok(()) => {},
                Err(HookError::Middleware(message)) => {
                    warn!(
                        middleware = registration.middleware.name(),
                        hook = hook_type.as_str(),
                        %message,
                        "Middleware aborted hook chain"
                    );
                    ctx.error = Some(message);
                    aborted = true;
                    break;
                },
                Err(HookError::Other(err)) if registration.conditions.critical => {
                    warn!(
                        middleware = registration.middleware.name(),
                        hook = hook_type.as_str(),
                        error = %err,
                        "Critical middleware failed, aborting chain"
                    );
                    ctx.error = Some(err.to_string());
                    aborted = true;
                    break;
                },
                Err(HookError::Other(err)) => {
                    warn!(
                        middleware = registration.middleware.name(),
                        hook = hook_type.as_str(),
                        error = %err,
                        "Middleware failed, continuing chain"
                    );
                },
            }
        }

        let summary = ExecutionSummary {
            hook_type: hook_type.as_str(),
            executed,
            total,
            aborted,
        };

        ctx.metadata.insert(
            "last_execution".to_string(),
            json!({
                "hook_type": summary.hook_type,
                "elapsed_ms": started.elapsed().as_millis() as u64,
                "executed_count": summary.executed,
                "total_count": summary.total,
            }),
        );

        summary
    }

    /// Single table from hook type to the trait method it invokes.
    async fn dispatch(
        middleware: &dyn Middleware,
        hook_type: HookType,
        ctx: &mut MiddlewareContext,
    ) -> std::result::Result<(), HookError> {
        match hook_type {
            HookType::BeforeToolCall => middleware.before_tool_call(ctx).await,
            HookType::AfterToolCall => middleware.after_tool_call(ctx).await,
            HookType::OnToolError => middleware.on_tool_error(ctx).await,
            HookType::BeforeResourceRead => middleware.before_resource_read(ctx).await,
            HookType::AfterResourceRead => middleware.after_resource_read(ctx).await,
            HookType::OnResourceError => middleware.on_resource_error(ctx).await,
            HookType::BeforePromptGet => middleware.before_prompt_get(ctx).await,
            HookType::AfterPromptGet => middleware.after_prompt_get(ctx).await,
            HookType::OnPromptError => middleware.on_prompt_error(ctx).await,
            HookType::BeforeSamplingRequest => middleware.before_sampling_request(ctx).await,
            HookType::AfterSamplingResponse => middleware.after_sampling_response(ctx).await,
            HookType::OnSamplingError => middleware.on_sampling_error(ctx).await,
            HookType::BeforeRequest => middleware.before_request(ctx).await,
            HookType::AfterResponse => middleware.after_response(ctx).await,
            HookType::OnTransportError => middleware.on_transport_error(ctx).await,
            HookType::BeforeAuthentication => middleware.before_authentication(ctx).await,
            HookType::AfterAuthentication => middleware.after_authentication(ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::OperationType;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Records the order it was called in.
    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail_with: Option<fn() -> HookError>,
        set_skip: bool,
    }

    impl Recorder {
        fn new(label: &'static str, log: Arc<Mutex<Vec<&'static str>>>) -> Arc<Self> {
            Arc::new(Self {
                label,
                log,
                fail_with: None,
                set_skip: false,
            })
        }
    }

    #[async_trait]
    impl Middleware for Recorder {
        fn name(&self) -> &str {
            self.label
        }

        async fn call(
            &self,
            _hook: HookType,
            ctx: &mut MiddlewareContext,
        ) -> std::result::Result<(), HookError> {
            self.log.lock().push(self.label);
            if self.set_skip {
                ctx.skip_remaining_hooks = true;
            }
            match self.fail_with {
                Some(make) => Err(make()),
                None => Ok(()),
            }
        }
    }

    fn tool_ctx() -> MiddlewareContext {
        MiddlewareContext::new(OperationType::ToolCall, "echo", &json!({}), None)
    }

    #[tokio::test]
    async fn test_priority_then_registration_order() {
        let manager = MiddlewareManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        // Priorities [100, 50, 200, 50] registered in that order must
        // run as [50 (2nd), 50 (4th), 100, 200].
        for (label, priority) in [("p100", 100), ("p50a", 50), ("p200", 200), ("p50b", 50)] {
            manager.register(
                Recorder::new(label, log.clone()),
                &[HookType::BeforeToolCall],
                priority,
                HookConditions::default(),
            );
        }

        let mut ctx = tool_ctx();
        let summary = manager.execute(HookType::BeforeToolCall, &mut ctx).await;

        assert_eq!(summary.executed, 4);
        assert_eq!(*log.lock(), vec!["p50a", "p50b", "p100", "p200"]);
    }

    #[tokio::test]
    async fn test_skip_remaining_hooks() {
        let manager = MiddlewareManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let skipper = Arc::new(Recorder {
            label: "skipper",
            log: log.clone(),
            fail_with: None,
            set_skip: true,
        });
        manager.register(skipper, &[HookType::BeforeToolCall], 10, HookConditions::default());
        manager.register_simple(Recorder::new("after", log.clone()), &[HookType::BeforeToolCall]);

        let mut ctx = tool_ctx();
        let summary = manager.execute(HookType::BeforeToolCall, &mut ctx).await;

        assert_eq!(summary.executed, 1);
        assert_eq!(*log.lock(), vec!["skipper"]);
    }

    #[tokio::test]
    async fn test_operation_type_gating() {
        let manager = MiddlewareManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        manager.register_simple(Recorder::new("tool-only", log.clone()), &[HookType::BeforeToolCall]);

        // A resource-read context never reaches a tool hook.
        let mut ctx =
            MiddlewareContext::new(OperationType::ResourceRead, "file://x", &json!({}), None);
        let summary = manager.execute(HookType::BeforeToolCall, &mut ctx).await;

        assert_eq!(summary.executed, 0);
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_middleware_error_aborts() {
        let manager = MiddlewareManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let failing = Arc::new(Recorder {
            label: "failing",
            log: log.clone(),
            fail_with: Some(|| HookError::Middleware("policy violation".into())),
            set_skip: false,
        });
        manager.register(failing, &[HookType::BeforeToolCall], 1, HookConditions::default());
        manager.register_simple(Recorder::new("never", log.clone()), &[HookType::BeforeToolCall]);

        let mut ctx = tool_ctx();
        let summary = manager.execute(HookType::BeforeToolCall, &mut ctx).await;

        assert!(summary.aborted);
        assert_eq!(ctx.error.as_deref(), Some("policy violation"));
        assert_eq!(*log.lock(), vec!["failing"]);
    }

    #[tokio::test]
    async fn test_incidental_error_skipped_unless_critical() {
        let manager = MiddlewareManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let flaky = Arc::new(Recorder {
            label: "flaky",
            log: log.clone(),
            fail_with: Some(|| HookError::Other(anyhow::anyhow!("transient"))),
            set_skip: false,
        });
        manager.register(flaky.clone(), &[HookType::BeforeToolCall], 1, HookConditions::default());
        manager.register_simple(Recorder::new("next", log.clone()), &[HookType::BeforeToolCall]);

        let mut ctx = tool_ctx();
        let summary = manager.execute(HookType::BeforeToolCall, &mut ctx).await;
        assert!(!summary.aborted);
        assert_eq!(*log.lock(), vec!["flaky", "next"]);
        assert!(ctx.error.is_none());

        // Same failure under critical aborts.
        let manager = MiddlewareManager::new();
        log.lock().clear();
        manager.register(
            flaky,
            &[HookType::BeforeToolCall],
            1,
            HookConditions {
                critical: true,
                ..Default::default()
            },
        );
        manager.register_simple(Recorder::new("never", log.clone()), &[HookType::BeforeToolCall]);

        let mut ctx = tool_ctx();
        let summary = manager.execute(HookType::BeforeToolCall, &mut ctx).await;
        assert!(summary.aborted);
        assert_eq!(*log.lock(), vec!["flaky"]);
    }

    #[tokio::test]
    async fn test_timing_metadata_attached() {
        let manager = MiddlewareManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        manager.register_simple(Recorder::new("one", log), &[HookType::BeforeToolCall]);

        let mut ctx = tool_ctx();
        manager.execute(HookType::BeforeToolCall, &mut ctx).await;

        let timing = ctx.metadata.get("last_execution").unwrap();
        assert_eq!(timing["hook_type"], "before_tool_call");
        assert_eq!(timing["executed_count"], 1);
        assert_eq!(timing["total_count"], 1);
        assert!(timing["elapsed_ms"].is_u64());
    }
}
