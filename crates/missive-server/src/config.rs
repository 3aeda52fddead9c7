//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;

use missive_shared::constants::{DEFAULT_HTTP_PORT, DEFAULT_PARENT_CHANNEL, DEFAULT_TOKEN_TTL_SECS};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file. Unset keeps everything in memory.
    /// Env: `DATABASE_PATH`
    pub database_path: Option<PathBuf>,

    /// Root segment under which every record is stored.
    /// Env: `PARENT_CHANNEL`
    /// Default: `messages`
    pub parent_channel: String,

    /// Lifetime of issued tokens, in seconds.
    /// Env: `TOKEN_TTL_SECS`
    /// Default: `1800`
    pub token_ttl_secs: i64,

    /// Allow any origin on the HTTP API.
    /// Env: `CORS_ANY` (true/false)
    /// Default: `true`
    pub cors_any: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: None,
            parent_channel: DEFAULT_PARENT_CHANNEL.to_string(),
            token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            cors_any: true,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(path) = var("DATABASE_PATH") {
            if !path.is_empty() {
                config.database_path = Some(PathBuf::from(path));
            }
        }

        if let Some(parent) = var("PARENT_CHANNEL") {
            if parent.is_empty() {
                tracing::warn!("Empty PARENT_CHANNEL, using default");
            } else {
                config.parent_channel = parent;
            }
        }

        if let Some(val) = var("TOKEN_TTL_SECS") {
            match val.parse::<i64>() {
                Ok(ttl) if ttl > 0 => config.token_ttl_secs = ttl,
                _ => tracing::warn!(value = %val, "Invalid TOKEN_TTL_SECS, using default"),
            }
        }

        if let Some(val) = var("CORS_ANY") {
            config.cors_any = val != "false" && val != "0";
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.parent_channel, "messages");
        assert_eq!(config.token_ttl_secs, 1800);
        assert!(config.database_path.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let config = load(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("DATABASE_PATH", "/tmp/missive.db"),
            ("PARENT_CHANNEL", "staging"),
            ("TOKEN_TTL_SECS", "60"),
            ("CORS_ANY", "false"),
        ]);
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.database_path, Some(PathBuf::from("/tmp/missive.db")));
        assert_eq!(config.parent_channel, "staging");
        assert_eq!(config.token_ttl_secs, 60);
        assert!(!config.cors_any);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = load(&[("HTTP_ADDR", "nowhere"), ("TOKEN_TTL_SECS", "-5")]);
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.token_ttl_secs, 1800);
    }
}
