//! MCP server core: capability registries and server identity.
//!
//! The server owns what gets exposed (tools, resources, prompts, an
//! optional sampling handler) and the machinery every transport shares
//! (middleware manager, security middleware, dispatcher). Handler
//! bodies are caller-registered async closures; the server only routes
//! to them.

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::Result;
use crate::middleware::security::SecurityMiddleware;
use crate::middleware::MiddlewareManager;
use crate::session::Session;

pub mod dispatcher;

pub use dispatcher::Dispatcher;

/// Context handed to every capability handler.
#[derive(Clone)]
pub struct HandlerContext {
    pub server: Arc<McpServer>,
    pub session: Arc<Session>,
}

/// Async capability handler: receives the call context and the request
/// arguments, returns the result value.
pub type Handler =
    Arc<dyn Fn(HandlerContext, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Wrap an async closure into a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(HandlerContext, Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move |ctx, args| Box::pin(f(ctx, args)))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub uri: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptDescriptor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

struct RegisteredTool {
    descriptor: ToolDescriptor,
    handler: Handler,
}

struct RegisteredResource {
    descriptor: ResourceDescriptor,
    handler: Handler,
}

struct RegisteredPrompt {
    descriptor: PromptDescriptor,
    handler: Handler,
}

pub struct McpServer {
    name: String,
    version: String,
    tools: DashMap<String, RegisteredTool>,
    resources: DashMap<String, RegisteredResource>,
    prompts: DashMap<String, RegisteredPrompt>,
    sampling: RwLock<Option<Handler>>,
    middleware: Arc<MiddlewareManager>,
    security: Arc<SecurityMiddleware>,
    /// Echo handler error messages into response data. Off outside
    /// development; messages are still logged.
    debug_errors: bool,
}

impl McpServer {
    pub fn new(config: &Config) -> Self {
        Self {
            name: config
                .server
                .name
                .clone()
                .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string()),
            version: env!("CARGO_PKG_VERSION").to_string(),
            tools: DashMap::new(),
            resources: DashMap::new(),
            prompts: DashMap::new(),
            sampling: RwLock::new(None),
            middleware: Arc::new(MiddlewareManager::new()),
            security: Arc::new(SecurityMiddleware::from_config(&config.auth)),
            debug_errors: false,
        }
    }

    pub fn with_debug_errors(mut self, enabled: bool) -> Self {
        self.debug_errors = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn debug_errors(&self) -> bool {
        self.debug_errors
    }

    pub fn middleware(&self) -> &Arc<MiddlewareManager> {
        &self.middleware
    }

    pub fn security(&self) -> &Arc<SecurityMiddleware> {
        &self.security
    }

    /// Register a tool. Re-registering a name replaces the previous
    /// entry.
    pub fn register_tool(&self, descriptor: ToolDescriptor, handler: Handler) {
        let name = descriptor.name.clone();
        if self
            .tools
            .insert(name.clone(), RegisteredTool { descriptor, handler })
            .is_some()
        {
            warn!(tool = %name, "Tool re-registered, previous handler replaced");
        } else {
            debug!(tool = %name, "Tool registered");
        }
    }

    pub fn register_resource(&self, descriptor: ResourceDescriptor, handler: Handler) {
        let uri = descriptor.uri.clone();
        if self
            .resources
            .insert(uri.clone(), RegisteredResource { descriptor, handler })
            .is_some()
        {
            warn!(resource = %uri, "Resource re-registered, previous handler replaced");
        } else {
            debug!(resource = %uri, "Resource registered");
        }
    }

    pub fn register_prompt(&self, descriptor: PromptDescriptor, handler: Handler) {
        let name = descriptor.name.clone();
        if self
            .prompts
            .insert(name.clone(), RegisteredPrompt { descriptor, handler })
            .is_some()
        {
            warn!(prompt = %name, "Prompt re-registered, previous handler replaced");
        } else {
            debug!(prompt = %name, "Prompt registered");
        }
    }

    /// Install the sampling delegate invoked by `sampling/createMessage`.
    pub fn set_sampling_handler(&self, handler: Handler) {
        *self.sampling.write() = Some(handler);
    }

    pub(crate) fn sampling_handler(&self) -> Option<Handler> {
        self.sampling.read().clone()
    }

    pub(crate) fn tool(&self, name: &str) -> Option<(ToolDescriptor, Handler)> {
        self.tools
            .get(name)
            .map(|t| (t.descriptor.clone(), t.handler.clone()))
    }

    pub(crate) fn resource(&self, uri: &str) -> Option<(ResourceDescriptor, Handler)> {
        self.resources
            .get(uri)
            .map(|r| (r.descriptor.clone(), r.handler.clone()))
    }

    pub(crate) fn prompt(&self, name: &str) -> Option<(PromptDescriptor, Handler)> {
        self.prompts
            .get(name)
            .map(|p| (p.descriptor.clone(), p.handler.clone()))
    }

    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        let mut tools: Vec<ToolDescriptor> =
            self.tools.iter().map(|t| t.descriptor.clone()).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn list_resources(&self) -> Vec<ResourceDescriptor> {
        let mut resources: Vec<ResourceDescriptor> =
            self.resources.iter().map(|r| r.descriptor.clone()).collect();
        resources.sort_by(|a, b| a.uri.cmp(&b.uri));
        resources
    }

    pub fn list_prompts(&self) -> Vec<PromptDescriptor> {
        let mut prompts: Vec<PromptDescriptor> =
            self.prompts.iter().map(|p| p.descriptor.clone()).collect();
        prompts.sort_by(|a, b| a.name.cmp(&b.name));
        prompts
    }

    /// Capability advertisement for the initialize reply, derived from
    /// what was registered.
    pub fn capabilities(&self) -> Value {
        let mut caps = json!({});

        if !self.tools.is_empty() {
            caps["tools"] = json!({"listChanged": false});
        }
        if !self.resources.is_empty() {
            caps["resources"] = json!({"subscribe": false, "listChanged": false});
        }
        if !self.prompts.is_empty() {
            caps["prompts"] = json!({"listChanged": false});
        }
        if self.sampling.read().is_some() {
            caps["sampling"] = json!({});
        }

        caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> McpServer {
        McpServer::new(&Config::default())
    }

    fn noop_handler() -> Handler {
        handler_fn(|_ctx, _args| async { Ok(json!({})) })
    }

    #[test]
    fn test_registration_and_listing() {
        let server = server();
        assert!(server.list_tools().is_empty());

        server.register_tool(
            ToolDescriptor {
                name: "b-tool".to_string(),
                description: None,
                input_schema: json!({"type": "object"}),
            },
            noop_handler(),
        );
        server.register_tool(
            ToolDescriptor {
                name: "a-tool".to_string(),
                description: Some("first".to_string()),
                input_schema: json!({"type": "object"}),
            },
            noop_handler(),
        );

        let tools = server.list_tools();
        assert_eq!(tools.len(), 2);
        // Listings are name-sorted for stable replies.
        assert_eq!(tools[0].name, "a-tool");
        assert_eq!(tools[1].name, "b-tool");
    }

    #[test]
    fn test_capabilities_follow_registration() {
        let server = server();
        assert_eq!(server.capabilities(), json!({}));

        server.register_tool(
            ToolDescriptor {
                name: "t".to_string(),
                description: None,
                input_schema: json!({}),
            },
            noop_handler(),
        );
        server.set_sampling_handler(noop_handler());

        let caps = server.capabilities();
        assert!(caps.get("tools").is_some());
        assert!(caps.get("sampling").is_some());
        assert!(caps.get("prompts").is_none());
    }

    #[test]
    fn test_reregistration_replaces() {
        let server = server();
        let descriptor = ToolDescriptor {
            name: "dup".to_string(),
            description: None,
            input_schema: json!({}),
        };
        server.register_tool(descriptor.clone(), noop_handler());
        server.register_tool(descriptor, noop_handler());

        assert_eq!(server.list_tools().len(), 1);
    }
}
