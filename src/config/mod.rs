//! Configuration Management Module
//!
//! Loads [`GatewayConfig`] from a JSON file:
//!
//! 1. `$SSH_GATEWAY_CONFIG` if set
//! 2. otherwise `<config_dir>/ssh-gateway/config.json`
//!
//! A missing file means defaults. `SSH_GATEWAY_HTTP_ADDR` and
//! `SSH_GATEWAY_WS_ADDR` override the listen addresses.

pub mod types;

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

pub use types::GatewayConfig;

pub const CONFIG_ENV: &str = "SSH_GATEWAY_CONFIG";
pub const HTTP_ADDR_ENV: &str = "SSH_GATEWAY_HTTP_ADDR";
pub const WS_ADDR_ENV: &str = "SSH_GATEWAY_WS_ADDR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },
}

/// `<config_dir>/ssh-gateway`
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("ssh-gateway"))
}

/// Path the gateway reads its configuration from
pub fn config_path() -> Option<PathBuf> {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .or_else(|| config_dir().map(|dir| dir.join("config.json")))
}

/// Load from the default location and apply environment overrides
pub fn load() -> Result<GatewayConfig, ConfigError> {
    let mut config = match config_path() {
        Some(path) => load_from(&path)?,
        None => GatewayConfig::default(),
    };
    apply_env(&mut config, |name| std::env::var(name).ok())?;
    Ok(config)
}

/// Load one file; a missing file yields defaults
pub fn load_from(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let shown = path.display().to_string();
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No config at {}, using defaults", shown);
            return Ok(GatewayConfig::default());
        }
        Err(source) => return Err(ConfigError::Io { path: shown, source }),
    };

    serde_json::from_str(&text).map_err(|source| ConfigError::Parse { path: shown, source })
}

fn apply_env(
    config: &mut GatewayConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    for (name, slot) in [
        (HTTP_ADDR_ENV, &mut config.http_addr),
        (WS_ADDR_ENV, &mut config.ws_addr),
    ] {
        if let Some(value) = lookup(name) {
            *slot = value
                .parse()
                .map_err(|_| ConfigError::InvalidEnv { name, value })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.ws_addr.port(), 8003);
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"ws_addr": "127.0.0.1:9003", "max_sessions_per_client": 2}}"#).unwrap();

        let config = load_from(file.path()).unwrap();
        assert_eq!(config.ws_addr.to_string(), "127.0.0.1:9003");
        assert_eq!(config.max_sessions_per_client, 2);
    }

    #[test]
    fn test_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ nope").unwrap();
        assert!(matches!(load_from(file.path()), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = GatewayConfig::default();
        apply_env(&mut config, |name| match name {
            HTTP_ADDR_ENV => Some("127.0.0.1:18000".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.http_addr.port(), 18000);
        assert_eq!(config.ws_addr.port(), 8003);

        let err = apply_env(&mut config, |_| Some("not an address".to_string())).unwrap_err();
        assert!(err.to_string().contains(HTTP_ADDR_ENV));
    }
}
