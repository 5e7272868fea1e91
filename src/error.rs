//! Gateway error taxonomy
//!
//! Every failure the registry or a pipeline can report maps onto one of these
//! variants. Callers decide about retries; nothing in the gateway retries on
//! its own.

use thiserror::Error;

/// Errors surfaced by the connection registry and the command pipeline
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Remote host rejected the supplied credentials
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Remote host unreachable, refused, or the handshake timed out
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Connection dropped while an operation was in progress
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation exceeded its deadline (seconds)
    #[error("Operation timed out after {0}s")]
    Timeout(f64),

    #[error("Remote I/O error: {0}")]
    RemoteIo(String),

    /// The external policy hook refused the lease
    #[error("Denied by policy: {0}")]
    PolicyDenied(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A command is already running on this session
    #[error("busy")]
    Busy,
}

impl GatewayError {
    /// Stable machine-readable category used on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "authentication",
            Self::Connect(_) => "connect",
            Self::Transport(_) => "transport",
            Self::Timeout(_) => "timeout",
            Self::RemoteIo(_) => "remote_io",
            Self::PolicyDenied(_) => "policy_denied",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Busy => "busy",
        }
    }
}

impl serde::Serialize for GatewayError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings() {
        assert_eq!(GatewayError::Authentication("x".into()).kind(), "authentication");
        assert_eq!(GatewayError::Timeout(3.0).kind(), "timeout");
        assert_eq!(GatewayError::Busy.to_string(), "busy");
    }

    #[test]
    fn test_serializes_as_display() {
        let json = serde_json::to_string(&GatewayError::Timeout(5.0)).unwrap();
        assert_eq!(json, "\"Operation timed out after 5s\"");
        assert_eq!(GatewayError::Timeout(0.5).to_string(), "Operation timed out after 0.5s");
    }
}
