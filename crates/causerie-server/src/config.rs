//! Server configuration loaded from environment variables.
//!
//! All settings have defaults so the node can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use causerie_shared::constants::{
    DEFAULT_DEBOUNCE_MS, DEFAULT_HTTP_PORT, DEFAULT_VAPID_KEY_FILE, DEFAULT_VAPID_SUBJECT,
};
use causerie_shared::Alias;

/// Node configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:3005`
    pub http_addr: SocketAddr,

    /// Filesystem path of the persisted VAPID key pair.  Generated on
    /// first start; unreadable or corrupt key material is fatal.
    /// Env: `VAPID_KEY_PATH`
    /// Default: `./vapid-keys.json`
    pub vapid_key_path: PathBuf,

    /// Contact claim presented to push providers in the VAPID token.
    /// Env: `VAPID_SUBJECT`
    /// Default: `mailto:ops@causerie.example`
    pub vapid_subject: String,

    /// Alias this node answers calls for.  When unset the node runs as a
    /// pure notification relay and the call engine is not started.
    /// Env: `LOCAL_ALIAS`
    /// Default: unset
    pub local_alias: Option<Alias>,

    /// Quiet window for coalescing chat notification bursts, in
    /// milliseconds.
    /// Env: `DEBOUNCE_MS`
    /// Default: `1000`
    pub debounce_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            vapid_key_path: PathBuf::from(DEFAULT_VAPID_KEY_FILE),
            vapid_subject: DEFAULT_VAPID_SUBJECT.to_string(),
            local_alias: None,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(path) = std::env::var("VAPID_KEY_PATH") {
            config.vapid_key_path = PathBuf::from(path);
        }

        if let Ok(subject) = std::env::var("VAPID_SUBJECT") {
            if !subject.is_empty() {
                config.vapid_subject = subject;
            }
        }

        if let Ok(alias) = std::env::var("LOCAL_ALIAS") {
            if !alias.is_empty() {
                config.local_alias = Some(Alias::new(alias));
            }
        }

        if let Ok(val) = std::env::var("DEBOUNCE_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                config.debounce_ms = ms;
            } else {
                tracing::warn!(value = %val, "Invalid DEBOUNCE_MS, using default");
            }
        }

        config
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 3005).into());
        assert_eq!(config.debounce_ms, 1000);
        assert!(config.local_alias.is_none());
    }

    #[test]
    fn test_debounce_window() {
        let config = ServerConfig {
            debounce_ms: 250,
            ..Default::default()
        };
        assert_eq!(config.debounce_window(), Duration::from_millis(250));
    }
}
