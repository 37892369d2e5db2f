//! Error types for Manifold MCP
//!
//! One taxonomy covers protocol errors (which carry JSON-RPC codes),
//! auth and browser-bridge errors (which only surface over HTTP), and
//! infrastructure errors. Transport code maps protocol errors to HTTP
//! statuses via [`Error::http_status`].

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::io;
use thiserror::Error;

use crate::types::codes;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Server not initialized")]
    NotInitialized,

    #[error("Server error: {0}")]
    Server(String),

    #[error("Sampling error: {0}")]
    Sampling(String),

    #[error("Authentication required")]
    AuthRequired,

    #[error("Authorization failed: {0}")]
    AuthorizationFailed(String),

    #[error("Command timeout after {0}ms")]
    CommandTimeout(u64),

    #[error("Chrome extension not connected")]
    ExtensionNotConnected,

    #[error("Session terminated: {0}")]
    SessionTerminated(String),

    #[error("Middleware error: {0}")]
    Middleware(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// JSON-RPC error code for protocol-visible errors.
    ///
    /// Errors that never serialize into a JSON-RPC body (auth, bridge
    /// timeouts) return `None`; the HTTP layer renders those directly.
    pub fn jsonrpc_code(&self) -> Option<i32> {
        match self {
            Error::Parse(_) | Error::Json(_) => Some(codes::PARSE_ERROR),
            Error::InvalidRequest(_) => Some(codes::INVALID_REQUEST),
            Error::MethodNotFound(_) => Some(codes::METHOD_NOT_FOUND),
            Error::InvalidParams(_) => Some(codes::INVALID_PARAMS),
            Error::Internal(_) | Error::Middleware(_) => Some(codes::INTERNAL_ERROR),
            Error::NotFound(_) | Error::SessionTerminated(_) => Some(codes::NOT_FOUND),
            Error::NotInitialized => Some(codes::NOT_INITIALIZED),
            Error::Server(_) | Error::Transport(_) | Error::Sampling(_) => {
                Some(codes::SERVER_ERROR)
            },
            _ => None,
        }
    }

    /// HTTP status for this error, following the transport code mapping:
    /// -32700/-32600/-32602/-32002 map to 400, -32601/-32001 to 404,
    /// -32603 and the generic -32000..-32099 range to 500.
    pub fn http_status(&self) -> StatusCode {
        match self {
            Error::AuthRequired => StatusCode::UNAUTHORIZED,
            Error::AuthorizationFailed(_) => StatusCode::FORBIDDEN,
            Error::CommandTimeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::ExtensionNotConnected => StatusCode::SERVICE_UNAVAILABLE,
            _ => match self.jsonrpc_code() {
                Some(code) => Self::status_for_code(code),
                None => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Map an HTTP-facing status for a raw JSON-RPC code (used when the
    /// code arrives already serialized, e.g. from a handler-built error).
    pub fn status_for_code(code: i32) -> StatusCode {
        match code {
            codes::PARSE_ERROR
            | codes::INVALID_REQUEST
            | codes::INVALID_PARAMS
            | codes::NOT_INITIALIZED => StatusCode::BAD_REQUEST,
            codes::METHOD_NOT_FOUND | codes::NOT_FOUND => StatusCode::NOT_FOUND,
            c if (-32099..=-32000).contains(&c) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.http_status();

        let body = match self.jsonrpc_code() {
            Some(code) => Json(json!({
                "jsonrpc": "2.0",
                "error": {
                    "code": code,
                    "message": self.to_string(),
                },
                "id": null
            })),
            None => Json(json!({
                "error": self.to_string(),
            })),
        };

        (status, body).into_response()
    }
}
