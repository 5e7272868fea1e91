//! Connection identity
//!
//! A [`ConnectionKey`] names one endpoint plus the credential used to reach it.
//! Two requests share a pooled connection only when their keys are equal, so the
//! credential is part of the identity: the same `user@host:port` reached with
//! two different passwords yields two separate pool entries.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::GatewayError;

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

const MAX_HOSTNAME_LEN: usize = 255;
const MAX_USERNAME_LEN: usize = 128;
const MAX_KEY_CONTENT_LEN: usize = 256 * 1024;
const MAX_COMMAND_LEN: usize = 64 * 1024;

/// Authentication descriptor carried by a connection request
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Credential {
    Password {
        password: String,
    },
    /// Private key file on the gateway host
    KeyFile {
        path: String,
        passphrase: Option<String>,
    },
    /// Private key material supplied inline by the caller
    KeyContent {
        pem: String,
        passphrase: Option<String>,
    },
}

impl Credential {
    /// Short label for logs; never includes secret material
    pub fn method(&self) -> &'static str {
        match self {
            Self::Password { .. } => "password",
            Self::KeyFile { .. } => "key_file",
            Self::KeyContent { .. } => "key_content",
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password { .. } => f.write_str("Password(***)"),
            Self::KeyFile { path, .. } => write!(f, "KeyFile({})", path),
            Self::KeyContent { .. } => f.write_str("KeyContent(***)"),
        }
    }
}

/// Immutable endpoint + credential identity of a pooled connection
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    host: String,
    port: u16,
    username: String,
    credential: Credential,
}

impl ConnectionKey {
    /// Build a validated key.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        credential: Credential,
    ) -> Result<Self, GatewayError> {
        let host = host.into().trim().to_string();
        let username = username.into().trim().to_string();

        if host.is_empty() {
            return Err(GatewayError::InvalidRequest("hostname must not be empty".into()));
        }
        if username.is_empty() {
            return Err(GatewayError::InvalidRequest("username must not be empty".into()));
        }
        if port == 0 {
            return Err(GatewayError::InvalidRequest("port out of range".into()));
        }
        if host.len() > MAX_HOSTNAME_LEN || username.len() > MAX_USERNAME_LEN {
            return Err(GatewayError::InvalidRequest("connection parameters too long".into()));
        }
        if let Credential::KeyContent { pem, .. } = &credential {
            if pem.len() > MAX_KEY_CONTENT_LEN {
                return Err(GatewayError::InvalidRequest("key_content too large".into()));
            }
        }

        Ok(Self {
            host,
            port,
            username,
            credential,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// `user@host:port`, used for introspection and logs
    pub fn endpoint(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

impl fmt::Debug for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionKey")
            .field("endpoint", &self.endpoint())
            .field("credential", &self.credential)
            .finish()
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.endpoint())
    }
}

/// Terminal geometry in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    pub const MIN_COLS: u16 = 20;
    pub const MAX_COLS: u16 = 500;
    pub const MIN_ROWS: u16 = 5;
    pub const MAX_ROWS: u16 = 300;

    /// Clamp caller-supplied geometry into the supported range
    pub fn clamped(cols: u32, rows: u32) -> Self {
        Self {
            cols: cols.clamp(Self::MIN_COLS as u32, Self::MAX_COLS as u32) as u16,
            rows: rows.clamp(Self::MIN_ROWS as u32, Self::MAX_ROWS as u32) as u16,
        }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Connection parameters as they arrive on either surface.
///
/// Aliases cover the spellings browser clients send (`keyFile`, `width`, ...).
#[derive(Clone, Default, Deserialize)]
pub struct ConnectRequest {
    #[serde(alias = "host")]
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u32,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default, alias = "keyFile")]
    pub key_file: Option<String>,
    #[serde(default, alias = "keyContent")]
    pub key_content: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default, alias = "width")]
    pub cols: Option<u32>,
    #[serde(default, alias = "height")]
    pub rows: Option<u32>,
}

fn default_port() -> u32 {
    DEFAULT_SSH_PORT as u32
}

impl ConnectRequest {
    /// Validate and convert into a pool key
    pub fn to_key(&self) -> Result<ConnectionKey, GatewayError> {
        let port = u16::try_from(self.port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| GatewayError::InvalidRequest("port out of range".into()))?;

        let non_empty = |v: &Option<String>| v.as_ref().filter(|s| !s.is_empty()).cloned();
        let passphrase = non_empty(&self.passphrase);

        let credential = if let Some(password) = non_empty(&self.password) {
            Credential::Password { password }
        } else if let Some(pem) = non_empty(&self.key_content) {
            Credential::KeyContent { pem, passphrase }
        } else if let Some(path) = non_empty(&self.key_file) {
            Credential::KeyFile { path, passphrase }
        } else {
            return Err(GatewayError::InvalidRequest(
                "either password or key must be provided".into(),
            ));
        };

        ConnectionKey::new(&self.hostname, port, &self.username, credential)
    }

    /// Initial terminal geometry, if the caller supplied any
    pub fn terminal_size(&self) -> TerminalSize {
        let default = TerminalSize::default();
        TerminalSize::clamped(
            self.cols.unwrap_or(default.cols as u32),
            self.rows.unwrap_or(default.rows as u32),
        )
    }
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Reject commands the remote side should never see
pub fn validate_command(command: &str) -> Result<(), GatewayError> {
    if command.trim().is_empty() {
        return Err(GatewayError::InvalidRequest("command is empty".into()));
    }
    if command.len() > MAX_COMMAND_LEN {
        return Err(GatewayError::InvalidRequest("command too long".into()));
    }
    if command.contains('\0') {
        return Err(GatewayError::InvalidRequest(
            "command contains illegal characters".into(),
        ));
    }
    Ok(())
}
