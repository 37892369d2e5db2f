//! Authentication strategies and authorization policies.
//!
//! Strategies are registered by name with one default; each takes a
//! normalized request and yields a user record or nothing. Authorization
//! is opt-in and keyed by resource type: with it enabled but no policy
//! registered for a type, access is allowed. A policy that panics
//! counts as a deny.

use axum::http::StatusCode;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::AuthConfig;
use crate::context::RequestContext;

pub const CODE_AUTHENTICATION_REQUIRED: &str = "AUTHENTICATION_REQUIRED";
pub const CODE_AUTHORIZATION_FAILED: &str = "AUTHORIZATION_FAILED";

/// Request shape strategies operate on, independent of transport.
#[derive(Debug, Clone, Default)]
pub struct NormalizedRequest {
    pub method: String,
    pub path: String,
    /// Header names folded to lowercase.
    pub headers: HashMap<String, String>,
    pub params: HashMap<String, String>,
}

impl NormalizedRequest {
    pub fn from_context(ctx: &RequestContext) -> Self {
        Self {
            method: ctx.method().to_string(),
            path: ctx.path().to_string(),
            headers: ctx.headers().clone(),
            params: ctx.params().clone(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Record produced by a successful authentication.
#[derive(Debug, Clone, Serialize)]
pub struct AuthenticatedUser {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Strategy that produced this record.
    pub strategy: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub claims: HashMap<String, Value>,
}

impl AuthenticatedUser {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({"id": self.id}))
    }
}

/// An authentication scheme. Returns the user record or `None`.
pub trait AuthStrategy: Send + Sync {
    fn name(&self) -> &str;
    fn authenticate(&self, request: &NormalizedRequest) -> Option<AuthenticatedUser>;
}

/// Static API keys from configuration; checked against the `X-API-Key`
/// header, an `Authorization: ApiKey …` header, or an `api_key` query
/// parameter.
pub struct ApiKeyStrategy {
    keys: HashSet<String>,
}

impl ApiKeyStrategy {
    pub fn new(keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }

    fn extract<'a>(&self, request: &'a NormalizedRequest) -> Option<&'a str> {
        if let Some(key) = request.header("x-api-key") {
            return Some(key);
        }
        if let Some(auth) = request.header("authorization") {
            if let Some(key) = auth.strip_prefix("ApiKey ") {
                return Some(key);
            }
        }
        request.params.get("api_key").map(String::as_str)
    }
}

impl AuthStrategy for ApiKeyStrategy {
    fn name(&self) -> &str {
        "api_key"
    }

    fn authenticate(&self, request: &NormalizedRequest) -> Option<AuthenticatedUser> {
        let key = self.extract(request)?;
        if !self.keys.contains(key) {
            return None;
        }

        // Keys are bearer credentials; only a prefix identifies the
        // caller in logs.
        let prefix: String = key.chars().take(8).collect();
        Some(AuthenticatedUser {
            id: format!("api_key:{}", prefix),
            role: None,
            strategy: "api_key".to_string(),
            claims: HashMap::new(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BearerClaims {
    sub: String,
    #[serde(default)]
    role: Option<String>,
    exp: u64,
    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

/// HS256 bearer tokens validated against a configured secret.
pub struct BearerTokenStrategy {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl BearerTokenStrategy {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl AuthStrategy for BearerTokenStrategy {
    fn name(&self) -> &str {
        "bearer_token"
    }

    fn authenticate(&self, request: &NormalizedRequest) -> Option<AuthenticatedUser> {
        let token = request.header("authorization")?.strip_prefix("Bearer ")?;

        match decode::<BearerClaims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => Some(AuthenticatedUser {
                id: data.claims.sub,
                role: data.claims.role,
                strategy: "bearer_token".to_string(),
                claims: data.claims.extra,
            }),
            Err(err) => {
                debug!(error = %err, "Bearer token rejected");
                None
            },
        }
    }
}

/// Caller-supplied authentication closure.
pub struct CustomStrategy {
    name: String,
    func: Arc<dyn Fn(&NormalizedRequest) -> Option<AuthenticatedUser> + Send + Sync>,
}

impl CustomStrategy {
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(&NormalizedRequest) -> Option<AuthenticatedUser> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }
}

impl AuthStrategy for CustomStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn authenticate(&self, request: &NormalizedRequest) -> Option<AuthenticatedUser> {
        (self.func)(request)
    }
}

/// Kind of capability an authorization policy is keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Tool,
    Resource,
    Prompt,
    Root,
    Other(String),
}

impl ResourceType {
    /// Infer from the resource object's nominal kind, falling back to
    /// shape heuristics when no explicit kind is present.
    pub fn infer(resource: &Value) -> Self {
        let kind = resource
            .get("kind")
            .or_else(|| resource.get("type"))
            .and_then(Value::as_str);

        if let Some(kind) = kind {
            return Self::from_name(kind);
        }

        if resource.get("inputSchema").is_some() {
            ResourceType::Tool
        } else if resource.get("uri").is_some() {
            ResourceType::Resource
        } else if resource.get("arguments").is_some() || resource.get("messages").is_some() {
            ResourceType::Prompt
        } else {
            ResourceType::Other("unknown".to_string())
        }
    }

    /// Parse a name, accepting suffixed class-style names like
    /// `RegisteredTool`.
    pub fn from_name(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower == "tool" || lower.ends_with("tool") {
            ResourceType::Tool
        } else if lower == "prompt" || lower.ends_with("prompt") {
            ResourceType::Prompt
        } else if lower == "root" || lower.ends_with("root") {
            ResourceType::Root
        } else if lower == "resource" || lower.ends_with("resource") {
            ResourceType::Resource
        } else {
            ResourceType::Other(lower)
        }
    }
}

type PolicyFn = Arc<dyn Fn(&AuthenticatedUser, &str, &Value) -> bool + Send + Sync>;

/// Result of [`SecurityMiddleware::process_request`].
#[derive(Debug, Clone)]
pub struct SecurityOutcome {
    pub success: bool,
    pub user: Option<AuthenticatedUser>,
    pub code: Option<&'static str>,
    pub status: StatusCode,
    pub message: Option<String>,
}

impl SecurityOutcome {
    fn allowed(user: Option<AuthenticatedUser>) -> Self {
        Self {
            success: true,
            user,
            code: None,
            status: StatusCode::OK,
            message: None,
        }
    }

    fn unauthenticated() -> Self {
        Self {
            success: false,
            user: None,
            code: Some(CODE_AUTHENTICATION_REQUIRED),
            status: StatusCode::UNAUTHORIZED,
            message: Some("Authentication required".to_string()),
        }
    }

    fn denied(user: Option<AuthenticatedUser>, message: String) -> Self {
        Self {
            success: false,
            user,
            code: Some(CODE_AUTHORIZATION_FAILED),
            status: StatusCode::FORBIDDEN,
            message: Some(message),
        }
    }

    /// Session context map handed to handlers on success.
    pub fn session_context(&self) -> Value {
        match &self.user {
            Some(user) => json!({"user": user.to_value()}),
            None => json!({"user": null}),
        }
    }
}

/// Pluggable authentication plus opt-in authorization.
///
/// Effectively immutable after configuration: strategies and policies
/// are normally installed at startup, though the locks keep runtime
/// registration safe.
pub struct SecurityMiddleware {
    strategies: RwLock<HashMap<String, Arc<dyn AuthStrategy>>>,
    default_strategy: RwLock<Option<String>>,
    auth_required: bool,
    authorization_enabled: AtomicBool,
    policies: RwLock<HashMap<ResourceType, PolicyFn>>,
}

impl SecurityMiddleware {
    /// Open instance: nothing required, nothing enforced.
    pub fn permissive() -> Self {
        Self {
            strategies: RwLock::new(HashMap::new()),
            default_strategy: RwLock::new(None),
            auth_required: false,
            authorization_enabled: AtomicBool::new(false),
            policies: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        let middleware = Self {
            strategies: RwLock::new(HashMap::new()),
            default_strategy: RwLock::new(None),
            auth_required: config.required,
            authorization_enabled: AtomicBool::new(config.authorization_enabled),
            policies: RwLock::new(HashMap::new()),
        };

        if !config.api_keys.is_empty() {
            middleware.register_strategy(
                Arc::new(ApiKeyStrategy::new(config.api_keys.iter().cloned())),
                config.strategy == "api_key",
            );
        }

        if let Some(secret) = &config.jwt_secret {
            middleware.register_strategy(
                Arc::new(BearerTokenStrategy::new(secret)),
                config.strategy == "bearer_token",
            );
        }

        middleware
    }

    pub fn auth_required(&self) -> bool {
        self.auth_required
    }

    /// Register a strategy under its own name, optionally making it
    /// the default. The first registration becomes the default when
    /// none is set.
    pub fn register_strategy(&self, strategy: Arc<dyn AuthStrategy>, default: bool) {
        let name = strategy.name().to_string();
        self.strategies.write().insert(name.clone(), strategy);

        let mut slot = self.default_strategy.write();
        if default || slot.is_none() {
            *slot = Some(name);
        }
    }

    pub fn set_authorization_enabled(&self, enabled: bool) {
        self.authorization_enabled.store(enabled, Ordering::Release);
    }

    /// Install a policy for a resource type: `f(user, action,
    /// resource) -> bool`.
    pub fn add_policy(
        &self,
        resource_type: ResourceType,
        policy: impl Fn(&AuthenticatedUser, &str, &Value) -> bool + Send + Sync + 'static,
    ) {
        self.policies.write().insert(resource_type, Arc::new(policy));
    }

    /// Try the named strategy, or the default.
    pub fn authenticate(
        &self,
        request: &NormalizedRequest,
        strategy_override: Option<&str>,
    ) -> Option<AuthenticatedUser> {
        let name = match strategy_override {
            Some(name) => name.to_string(),
            None => self.default_strategy.read().clone()?,
        };

        let strategy = self.strategies.read().get(&name).cloned();
        match strategy {
            Some(strategy) => strategy.authenticate(request),
            None => {
                warn!(strategy = %name, "Unknown authentication strategy");
                None
            },
        }
    }

    /// Authorization verdict for `user` performing `action` on
    /// `resource`. Policies are opt-in per type; a missing policy
    /// allows. A panicking policy denies.
    pub fn authorize(&self, user: &AuthenticatedUser, action: &str, resource: &Value) -> bool {
        if !self.authorization_enabled.load(Ordering::Acquire) {
            return true;
        }

        let resource_type = ResourceType::infer(resource);
        let policy = self.policies.read().get(&resource_type).cloned();

        match policy {
            None => true,
            Some(policy) => {
                match catch_unwind(AssertUnwindSafe(|| policy(user, action, resource))) {
                    Ok(verdict) => verdict,
                    Err(_) => {
                        warn!(
                            user_id = %user.id,
                            action,
                            ?resource_type,
                            "Authorization policy panicked, denying"
                        );
                        false
                    },
                }
            },
        }
    }

    /// Full request gate: authenticate, then (when an action and a
    /// resource are supplied) authorize.
    pub fn process_request(
        &self,
        request: &NormalizedRequest,
        action: Option<&str>,
        resource: Option<&Value>,
    ) -> SecurityOutcome {
        let user = self.authenticate(request, None);

        if self.auth_required && user.is_none() {
            return SecurityOutcome::unauthenticated();
        }

        if let (Some(action), Some(resource)) = (action, resource) {
            if let Some(user) = &user {
                if !self.authorize(user, action, resource) {
                    return SecurityOutcome::denied(
                        Some(user.clone()),
                        format!("not permitted to {} this resource", action),
                    );
                }
            }
        }

        SecurityOutcome::allowed(user)
    }
}
