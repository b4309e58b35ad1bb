//! # Configuration Management
//!
//! This module handles loading and managing gateway configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms set these)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_ADMISSION__HANDSHAKE_TIMEOUT_MS`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Sections are separated from keys with a double underscore so that keys
//! containing underscores (`handshake_timeout_ms`) survive the mapping.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main gateway configuration.
///
/// ## Why separate config structs:
/// Each section maps to one concern: where we listen (`server`), how strict
/// admission is (`admission`), and where sessions are published (`discovery`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub admission: AdmissionConfig,
    pub discovery: DiscoveryConfig,
}

/// Where the gateway listens.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (behind a proxy)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9090,
        }
    }
}

/// Handshake and connection-lifetime settings.
///
/// ## Fields:
/// - `handshake_timeout_ms`: How long a fresh connection may stay silent before it is closed
/// - `max_concurrent_sessions`: Upper bound on active sessions on this instance
/// - `heartbeat_interval_secs`: How often the server pings each client
/// - `client_timeout_secs`: Silence after which a client is considered gone
///
/// Changes apply to connections opened after the change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    pub handshake_timeout_ms: u64,
    pub max_concurrent_sessions: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5000,
            max_concurrent_sessions: 256,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 60,
        }
    }
}

/// Service discovery publication settings.
///
/// ## Fields:
/// - `enabled`: Publish active sessions at all
/// - `kv_url`: Base URL of the key/value HTTP API (e.g. a Consul agent)
/// - `key_prefix`: Keys are written as `{key_prefix}/{uid}`
/// - `advertise_address`: Externally reachable `host:port`; empty means "use the bind address"
/// - `request_timeout_ms`: Per-request timeout for registrar calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub kv_url: String,
    pub key_prefix: String,
    pub advertise_address: String,
    pub request_timeout_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kv_url: "http://127.0.0.1:8500".to_string(),
            key_prefix: "transcription/servers".to_string(),
            advertise_address: String::new(),
            request_timeout_ms: 2000,
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_ADMISSION__HANDSHAKE_TIMEOUT_MS=3000`: Shorter handshake window
    /// - `APP_DISCOVERY__ENABLED=true`: Turn on discovery publication
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Handshake timeout and session limit are non-zero
    /// - Client timeout is longer than the heartbeat interval (or every client would time out)
    /// - A registrar URL is set when discovery is enabled
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.admission.handshake_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Handshake timeout must be greater than 0"));
        }

        if self.admission.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.admission.heartbeat_interval_secs == 0 {
            return Err(anyhow::anyhow!("Heartbeat interval must be greater than 0"));
        }

        if self.admission.client_timeout_secs <= self.admission.heartbeat_interval_secs {
            return Err(anyhow::anyhow!(
                "Client timeout ({}s) must be longer than the heartbeat interval ({}s)",
                self.admission.client_timeout_secs,
                self.admission.heartbeat_interval_secs
            ));
        }

        if self.discovery.enabled && self.discovery.kv_url.trim().is_empty() {
            return Err(anyhow::anyhow!("Discovery is enabled but kv_url is empty"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// Only the admission section can change at runtime; the listener and the
    /// discovery client are built once at startup.
    ///
    /// ## Partial updates:
    /// Send just `{"admission": {"handshake_timeout_ms": 3000}}` to change only the timeout.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if partial_config.get("server").is_some() || partial_config.get("discovery").is_some() {
            return Err(anyhow::anyhow!(
                "Only the admission section can be updated at runtime"
            ));
        }

        if let Some(admission) = partial_config.get("admission") {
            if let Some(timeout) = admission.get("handshake_timeout_ms").and_then(|v| v.as_u64()) {
                self.admission.handshake_timeout_ms = timeout;
            }
            if let Some(sessions) = admission.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                self.admission.max_concurrent_sessions = sessions as usize;
            }
            if let Some(interval) = admission.get("heartbeat_interval_secs").and_then(|v| v.as_u64()) {
                self.admission.heartbeat_interval_secs = interval;
            }
            if let Some(timeout) = admission.get("client_timeout_secs").and_then(|v| v.as_u64()) {
                self.admission.client_timeout_secs = timeout;
            }
        }

        self.validate()?;
        Ok(())
    }
}
