//! Configuration validation
//!
//! Collects every violation instead of failing on the first, so a bad
//! file is reported in one pass.

use super::Config;
use crate::error::{Error, Result};

/// Heartbeats faster than this starve the write loop; slower than this
/// lets intermediaries drop idle connections.
const HEARTBEAT_MIN_SECS: u64 = 5;
const HEARTBEAT_MAX_SECS: u64 = 300;

pub fn validate(config: &Config) -> Result<()> {
    let mut errors = Vec::new();

    if config.server.port == 0 {
        errors.push("server.port must be nonzero".to_string());
    }

    if !config.server.mcp_path.starts_with('/') {
        errors.push(format!(
            "server.mcp_path must start with '/': {}",
            config.server.mcp_path
        ));
    }

    if config.session.timeout_secs == 0 {
        errors.push("session.timeout_secs must be nonzero".to_string());
    }

    if config.session.cleanup_interval_secs == 0 {
        errors.push("session.cleanup_interval_secs must be nonzero".to_string());
    }

    if config.events.max_events == 0 {
        errors.push("events.max_events must be nonzero".to_string());
    }

    if config.sse.heartbeat_secs < HEARTBEAT_MIN_SECS
        || config.sse.heartbeat_secs > HEARTBEAT_MAX_SECS
    {
        errors.push(format!(
            "sse.heartbeat_secs must be within {}..={}, got {}",
            HEARTBEAT_MIN_SECS, HEARTBEAT_MAX_SECS, config.sse.heartbeat_secs
        ));
    }

    if config.sse.channel_capacity == 0 {
        errors.push("sse.channel_capacity must be nonzero".to_string());
    }

    if config.auth.required {
        match config.auth.strategy.as_str() {
            "api_key" => {
                if config.auth.api_keys.is_empty() {
                    errors.push("auth.api_keys is empty but auth.required is set".to_string());
                }
            },
            "bearer_token" => {
                if config.auth.jwt_secret.is_none() {
                    errors.push("auth.jwt_secret missing for bearer_token strategy".to_string());
                }
            },
            other => {
                errors.push(format!("unknown auth.strategy: {}", other));
            },
        }
    }

    if config.browser.enabled && config.browser.command_timeout_secs == 0 {
        errors.push("browser.command_timeout_secs must be nonzero".to_string());
    }

    if config.logging.output == "file" && config.logging.file.is_none() {
        errors.push("logging.file missing for logging.output = file".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Config(errors.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        validate(&Config::default()).unwrap();
    }

    #[test]
    fn test_zero_port_rejected() {
        let mut config = Config::default();
        config.server.port = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_heartbeat_bounds() {
        let mut config = Config::default();
        config.sse.heartbeat_secs = 2;
        assert!(validate(&config).is_err());

        config.sse.heartbeat_secs = 600;
        assert!(validate(&config).is_err());

        config.sse.heartbeat_secs = 30;
        validate(&config).unwrap();
    }

    #[test]
    fn test_auth_requires_material() {
        let mut config = Config::default();
        config.auth.required = true;
        config.auth.strategy = "api_key".to_string();
        assert!(validate(&config).is_err(), "no keys configured");

        config.auth.api_keys = vec!["k".to_string()];
        validate(&config).unwrap();

        config.auth.strategy = "bearer_token".to_string();
        assert!(validate(&config).is_err(), "no jwt secret");

        config.auth.jwt_secret = Some("secret".to_string());
        validate(&config).unwrap();
    }

    #[test]
    fn test_errors_are_collected() {
        let mut config = Config::default();
        config.server.port = 0;
        config.session.timeout_secs = 0;

        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("server.port"));
        assert!(err.contains("session.timeout_secs"));
    }
}
