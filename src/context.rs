//! Per-request metadata attached to sessions.
//!
//! A [`RequestContext`] is immutable once built. Every session owns its
//! own instance; minimal contexts are constructed fresh per session so
//! metadata never leaks between tenants.

use serde_json::Value;
use std::collections::HashMap;

use crate::types::TransportKind;

/// Immutable snapshot of the request a session was created from.
#[derive(Debug, Clone)]
pub struct RequestContext {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    params: HashMap<String, String>,
    metadata: HashMap<String, Value>,
}

impl RequestContext {
    /// Build a full context from HTTP framing.
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        headers: HashMap<String, String>,
        params: HashMap<String, String>,
        transport: TransportKind,
        remote_addr: Option<String>,
    ) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert(
            "transport_type".to_string(),
            Value::String(transport.as_str().to_string()),
        );
        if let Some(addr) = remote_addr {
            metadata.insert("remote_addr".to_string(), Value::String(addr));
        }

        Self {
            method: method.into(),
            path: path.into(),
            headers,
            params,
            metadata,
        }
    }

    /// Build a minimal context for transports with no HTTP framing.
    ///
    /// Callers must construct one per session. Sharing a minimal context
    /// across sessions would let metadata written for one tenant surface
    /// in another.
    pub fn minimal(transport: TransportKind) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert(
            "transport_type".to_string(),
            Value::String(transport.as_str().to_string()),
        );

        Self {
            method: String::new(),
            path: String::new(),
            headers: HashMap::new(),
            params: HashMap::new(),
            metadata,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Case-insensitive header lookup (HTTP header names are folded to
    /// lowercase at construction by the transport).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    pub fn transport_type(&self) -> Option<&str> {
        self.metadata.get("transport_type").and_then(Value::as_str)
    }

    pub fn remote_addr(&self) -> Option<&str> {
        self.metadata.get("remote_addr").and_then(Value::as_str)
    }
}
