//! Configuration Types
//!
//! Gateway settings as read from `config.json`. Every field has a default, so
//! an empty object (or no file at all) is a valid configuration.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::registry::RegistryConfig;
use crate::session::SessionConfig;

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Synchronous (HTTP) surface
    pub http_addr: SocketAddr,

    /// Streaming (WebSocket) surface
    pub ws_addr: SocketAddr,

    /// Default tracing filter; `RUST_LOG` wins when set
    pub log_level: String,

    /// TCP connect + handshake + authentication deadline
    pub connect_timeout_secs: u64,

    /// Unreferenced pooled connections idle this long are closed
    pub idle_timeout_secs: u64,

    pub sweep_interval_secs: u64,

    /// Used when a caller omits the command timeout
    pub default_command_timeout_secs: u64,

    /// Upper clamp for caller-supplied command timeouts
    pub max_command_timeout_secs: u64,

    /// Streaming sessions with no client traffic are closed after this long
    pub session_idle_timeout_secs: u64,

    /// Concurrent WebSocket channels per client IP
    pub max_sessions_per_client: usize,

    /// Largest accepted inbound WebSocket message
    pub max_message_bytes: usize,

    pub transfer_chunk_size: usize,

    /// Target hosts refused before connecting
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deny_hosts: Vec<String>,

    /// Client addresses refused on both surfaces
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deny_clients: Vec<IpAddr>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            ws_addr: SocketAddr::from(([0, 0, 0, 0], 8003)),
            log_level: "info".to_string(),
            connect_timeout_secs: 30,
            idle_timeout_secs: 300,
            sweep_interval_secs: 30,
            default_command_timeout_secs: 30,
            max_command_timeout_secs: 3600,
            session_idle_timeout_secs: 1800,
            max_sessions_per_client: 10,
            max_message_bytes: 256 * 1024,
            transfer_chunk_size: 32 * 1024,
            deny_hosts: Vec::new(),
            deny_clients: Vec::new(),
        }
    }
}

impl GatewayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn registry(&self) -> RegistryConfig {
        RegistryConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
        }
    }

    pub fn session(&self) -> SessionConfig {
        let max = Duration::from_secs(self.max_command_timeout_secs.max(1));
        SessionConfig {
            default_command_timeout: Duration::from_secs(self.default_command_timeout_secs.max(1)).min(max),
            max_command_timeout: max,
            idle_timeout: Duration::from_secs(self.session_idle_timeout_secs.max(1)),
        }
    }
}
