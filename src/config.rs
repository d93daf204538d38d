//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `FROXY_RELAY_URL`, `FROXY_RELAY_TOKEN`,
//!    `FROXY_LISTEN`, `FROXY_DOMAIN_FILTER`, `FROXY_ALLOWED_DOMAINS`
//! 2. **Config file** — path via `--config <path>`, or `froxy.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [relay]
//! url = "ws://relay.example.com:8080"   # http/https are mapped to ws/wss
//! token = "shared-secret"
//! heartbeat_interval_secs = 30
//! reconnect_delay_secs = 3              # agent only
//! liveness_timeout_secs = 0             # 0 = never close on silence
//!
//! [edge]
//! listen = "0.0.0.0:8888"
//! domain_filter = "hospital.local, 10.0.0.0/8"
//! relay_timeout_secs = 60
//! connect_timeout_secs = 10
//! direct_timeout_secs = 30
//! max_body_bytes = 10485760            # 10 MiB
//! max_header_bytes = 65536
//!
//! [agent]
//! allowed_domains = ""                 # empty = allow every host
//! accept_invalid_certs = false
//! request_timeout_secs = 30
//! max_redirects = 10
//! user_agent = "froxy-agent/1.0"
//!
//! [lifecycle]
//! shutdown_grace_ms = 2000
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub edge: EdgeConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Relay connection settings shared by both sides.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Relay base URL (default `ws://localhost:8080`). Path and query are replaced.
    #[serde(default = "default_relay_url")]
    pub url: String,
    /// Shared secret passed as `token`. Override with `FROXY_RELAY_TOKEN`.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_token")]
    pub token: String,
    /// Seconds between PING frames while the link is open (default 30).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Seconds between agent reconnect attempts (default 3).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Close the link after this many silent seconds; 0 disables (default).
    #[serde(default)]
    pub liveness_timeout_secs: u64,
}

/// Edge proxy (local HTTP/CONNECT listener) settings.
#[derive(Debug, Clone, Deserialize)]
pub struct EdgeConfig {
    /// Socket address to bind (default `0.0.0.0:8888`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Hosts routed through the relay; empty relays nothing.
    #[serde(default)]
    pub domain_filter: String,
    /// Seconds to wait for a relayed RESPONSE before answering 504 (default 60).
    #[serde(default = "default_relay_timeout")]
    pub relay_timeout_secs: u64,
    /// Seconds allowed to dial a CONNECT target before answering 504 (default 10).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Timeout for requests sent directly, bypassing the relay (default 30).
    #[serde(default = "default_direct_timeout")]
    pub direct_timeout_secs: u64,
    /// Largest accepted request body in bytes (default 10 MiB).
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Largest accepted request head in bytes (default 64 KiB).
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
}

/// Internal agent (request executor) settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Hosts the agent may reach; empty allows every host.
    #[serde(default)]
    pub allowed_domains: String,
    /// Skip TLS certificate validation for self-signed internal endpoints.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// Per-request timeout in seconds (default 30).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Redirects followed per request (default 10).
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    /// `User-Agent` sent when the forwarded request has none.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// Shutdown behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    /// Milliseconds to wait for in-flight tasks on stop (default 2000).
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_relay_url() -> String {
    "ws://localhost:8080".to_string()
}
fn default_token() -> String {
    "change-me".to_string()
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_reconnect_delay() -> u64 {
    3
}
fn default_listen() -> String {
    "0.0.0.0:8888".to_string()
}
fn default_relay_timeout() -> u64 {
    60
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_direct_timeout() -> u64 {
    30
}
fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024 // 10 MiB
}
fn default_max_header_bytes() -> usize {
    64 * 1024
}
fn default_request_timeout() -> u64 {
    30
}
fn default_max_redirects() -> usize {
    10
}
fn default_user_agent() -> String {
    concat!("froxy-agent/", env!("CARGO_PKG_VERSION")).to_string()
}
fn default_shutdown_grace_ms() -> u64 {
    2000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: default_relay_url(),
            token: default_token(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            reconnect_delay_secs: default_reconnect_delay(),
            liveness_timeout_secs: 0,
        }
    }
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            domain_filter: String::new(),
            relay_timeout_secs: default_relay_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            direct_timeout_secs: default_direct_timeout(),
            max_body_bytes: default_max_body_bytes(),
            max_header_bytes: default_max_header_bytes(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            allowed_domains: String::new(),
            accept_invalid_certs: false,
            request_timeout_secs: default_request_timeout(),
            max_redirects: default_max_redirects(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl RelayConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn liveness_timeout(&self) -> Option<Duration> {
        (self.liveness_timeout_secs > 0).then(|| Duration::from_secs(self.liveness_timeout_secs))
    }
}

impl LifecycleConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for `froxy.toml`
    /// in the current directory, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = if let Some(p) = path {
            Self::from_file(Path::new(p))?
        } else if Path::new("froxy.toml").exists() {
            Self::from_file(Path::new("froxy.toml"))?
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(url) = std::env::var("FROXY_RELAY_URL") {
            config.relay.url = url;
        }
        if let Ok(token) = std::env::var("FROXY_RELAY_TOKEN") {
            config.relay.token = token;
        }
        if let Ok(listen) = std::env::var("FROXY_LISTEN") {
            config.edge.listen = listen;
        }
        if let Ok(filter) = std::env::var("FROXY_DOMAIN_FILTER") {
            config.edge.domain_filter = filter;
        }
        if let Ok(allowed) = std::env::var("FROXY_ALLOWED_DOMAINS") {
            config.agent.allowed_domains = allowed;
        }

        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read config file {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Parse a TOML document; missing sections and fields take their defaults.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("failed to parse TOML: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.edge.listen, "0.0.0.0:8888");
        assert_eq!(config.edge.relay_timeout_secs, 60);
        assert_eq!(config.edge.connect_timeout_secs, 10);
        assert_eq!(config.edge.max_body_bytes, 10 * 1024 * 1024);
        assert_eq!(config.relay.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.relay.reconnect_delay(), Duration::from_secs(3));
        assert_eq!(config.relay.liveness_timeout(), None);
        assert_eq!(config.agent.request_timeout_secs, 30);
        assert!(!config.agent.accept_invalid_certs);
        assert_eq!(config.lifecycle.shutdown_grace(), Duration::from_secs(2));
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = Config::from_toml(
            r#"
            [relay]
            url = "https://relay.example.com:9443"
            token = "t0k"
            liveness_timeout_secs = 90

            [edge]
            domain_filter = "hospital.local"
            "#,
        )
        .unwrap();
        assert_eq!(config.relay.url, "https://relay.example.com:9443");
        assert_eq!(config.relay.token, "t0k");
        assert_eq!(config.relay.liveness_timeout(), Some(Duration::from_secs(90)));
        assert_eq!(config.edge.domain_filter, "hospital.local");
        assert_eq!(config.edge.listen, "0.0.0.0:8888");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn invalid_toml_is_config_error() {
        assert!(matches!(
            Config::from_toml("[edge]\nrelay_timeout_secs = \"soon\""),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn missing_file_is_config_error() {
        assert!(matches!(
            Config::load(Some("/nonexistent/froxy.toml")),
            Err(Error::Config(_))
        ));
    }
}
