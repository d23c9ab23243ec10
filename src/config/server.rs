//! Client transport (WebSocket server) configuration.

use serde::Deserialize;
use std::net::SocketAddr;

use super::error::ValidationError;

/// Downstream WebSocket server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    /// Messages allowed per rate-limit window.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,

    /// Fixed-window length in milliseconds.
    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window: u64,

    /// Idle timeout in milliseconds; sockets quieter than this close
    /// with code 4004.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    #[serde(default)]
    pub require_auth: bool,

    #[serde(default)]
    pub auth_tokens: Vec<String>,

    #[serde(default)]
    pub enable_compression: bool,

    /// Maximum inbound frame size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// JSON-level ping cadence in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        if self.max_clients == 0 {
            return Err(ValidationError::OutOfRange {
                field: "server.max_clients",
                min: 1,
                max: 10_000,
            });
        }
        if self.rate_limit == 0 {
            return Err(ValidationError::OutOfRange {
                field: "server.rate_limit",
                min: 1,
                max: u32::MAX as u64,
            });
        }
        if !(100..=3_600_000).contains(&self.rate_limit_window) {
            return Err(ValidationError::OutOfRange {
                field: "server.rate_limit_window",
                min: 100,
                max: 3_600_000,
            });
        }
        if self.require_auth && self.auth_tokens.is_empty() {
            return Err(ValidationError::NoAuthTokens);
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_clients: default_max_clients(),
            rate_limit: default_rate_limit(),
            rate_limit_window: default_rate_limit_window(),
            idle_timeout: default_idle_timeout(),
            require_auth: false,
            auth_tokens: Vec::new(),
            enable_compression: false,
            max_message_size: default_max_message_size(),
            heartbeat_interval: default_heartbeat_interval(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9180
}

fn default_max_clients() -> usize {
    64
}

fn default_rate_limit() -> u32 {
    120
}

fn default_rate_limit_window() -> u64 {
    10_000
}

fn default_idle_timeout() -> u64 {
    120_000
}

fn default_max_message_size() -> usize {
    256 * 1024
}

fn default_heartbeat_interval() -> u64 {
    30_000
}
