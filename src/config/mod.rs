//! Configuration module for Manifold MCP
//!
//! Handles loading and validation of configuration files. YAML and TOML
//! are both accepted; the format is chosen by file extension.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub mod validation;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub events: EventStoreConfig,
    #[serde(default)]
    pub sse: SseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub browser: BrowserBridgeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Single path prefix all MCP traffic is routed on.
    #[serde(default = "default_mcp_path")]
    pub mcp_path: String,
    pub name: Option<String>,
    /// Seconds to wait for in-flight handlers during shutdown.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            mcp_path: default_mcp_path(),
            name: None,
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Inactivity window before a session is evicted.
    #[serde(default = "default_session_timeout_secs")]
    pub timeout_secs: u64,
    /// Period of the background cleanup sweep.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_true")]
    pub auto_cleanup: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_session_timeout_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            auto_cleanup: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventStoreConfig {
    /// Ring-buffer capacity for resumable SSE events.
    #[serde(default = "default_max_events")]
    pub max_events: usize,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SseConfig {
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Outbound channel depth per streaming connection.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AuthConfig {
    /// When false every request is processed as anonymous.
    #[serde(default)]
    pub required: bool,
    /// Default strategy name: "api_key" or "bearer_token".
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// HS256 secret for the bearer_token strategy.
    pub jwt_secret: Option<String>,
    /// Opt-in authorization policy evaluation.
    #[serde(default)]
    pub authorization_enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrowserBridgeConfig {
    #[serde(default)]
    pub enabled: bool,
    /// How long a tool-facing endpoint blocks on a command result.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Extension counts as disconnected after this many seconds
    /// without a ping.
    #[serde(default = "default_liveness_secs")]
    pub liveness_secs: u64,
}

impl Default for BrowserBridgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command_timeout_secs: default_command_timeout_secs(),
            liveness_secs: default_liveness_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "text" or "json".
    #[serde(default = "default_log_format")]
    pub format: String,
    /// "stdout", "stderr" or "file".
    #[serde(default = "default_log_output")]
    pub output: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            output: default_log_output(),
            file: None,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_mcp_path() -> String {
    "/mcp".to_string()
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_session_timeout_secs() -> u64 {
    300
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

fn default_max_events() -> usize {
    1024
}

fn default_heartbeat_secs() -> u64 {
    15
}

fn default_channel_capacity() -> usize {
    256
}

fn default_strategy() -> String {
    "api_key".to_string()
}

fn default_command_timeout_secs() -> u64 {
    30
}

fn default_liveness_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_log_output() -> String {
    "stderr".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load a configuration file, choosing the parser by extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Cannot read {}: {}", path.display(), e)))?;

        let config: Config = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            other => {
                return Err(Error::Config(format!(
                    "Unsupported config extension: {:?}",
                    other
                )))
            },
        };

        validation::validate(&config)?;
        Ok(config)
    }

    /// Probe conventional locations, falling back to defaults when no
    /// file exists.
    pub fn discover_and_load() -> Result<Self> {
        for path in Self::candidate_paths() {
            if path.exists() {
                tracing::info!("Loading configuration from {}", path.display());
                return Self::from_file(&path);
            }
        }

        tracing::debug!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    /// Validate a file without constructing a server.
    pub fn validate_file(path: impl AsRef<Path>) -> Result<()> {
        Self::from_file(path).map(|_| ())
    }

    fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = vec![
            PathBuf::from("manifold-mcp.yaml"),
            PathBuf::from("manifold-mcp.yml"),
            PathBuf::from("manifold-mcp.toml"),
        ];

        if let Ok(home) = std::env::var("HOME") {
            let base = PathBuf::from(home).join(".config").join("manifold-mcp");
            paths.push(base.join("config.yaml"));
            paths.push(base.join("config.toml"));
        }

        paths
    }

    /// Commented YAML template for `config generate`.
    pub fn template() -> &'static str {
        include_str!("template.yaml")
    }
}
