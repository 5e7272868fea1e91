//! File transfer error types

use thiserror::Error;

use crate::error::GatewayError;

/// Transfer failures. Every variant raised after bytes started moving states
/// how many reached the destination, so callers can resume.
#[derive(Debug, Clone, Error)]
pub enum TransferError {
    #[error("Local I/O error on {path}: {message} ({bytes} bytes written)")]
    LocalIo {
        path: String,
        message: String,
        bytes: u64,
    },

    #[error("Remote I/O error on {path}: {message}")]
    RemoteIo { path: String, message: String },

    #[error("Transfer interrupted after {bytes} bytes: {message}")]
    Interrupted { message: String, bytes: u64 },

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

impl TransferError {
    /// Bytes successfully written to the destination before the failure
    pub fn bytes_written(&self) -> u64 {
        match self {
            Self::LocalIo { bytes, .. } | Self::Interrupted { bytes, .. } => *bytes,
            Self::RemoteIo { .. } | Self::InvalidPath(_) => 0,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::LocalIo { .. } => "local_io",
            Self::RemoteIo { .. } => "remote_io",
            Self::Interrupted { .. } => "transport",
            Self::InvalidPath(_) => "invalid_request",
        }
    }

    /// Map a failure to open the remote side
    pub(crate) fn from_open(path: &str, err: GatewayError) -> Self {
        match err {
            GatewayError::RemoteIo(message) => Self::RemoteIo {
                path: path.to_string(),
                message,
            },
            other => Self::Interrupted {
                message: other.to_string(),
                bytes: 0,
            },
        }
    }
}

impl serde::Serialize for TransferError {
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
    fn test_bytes_written() {
        let err = TransferError::Interrupted {
            message: "connection reset".into(),
            bytes: 4096,
        };
        assert_eq!(err.bytes_written(), 4096);
        assert!(err.to_string().contains("4096 bytes"));
        assert_eq!(TransferError::InvalidPath("".into()).bytes_written(), 0);
    }

    #[test]
    fn test_open_failure_mapping() {
        let err = TransferError::from_open("/etc/x", GatewayError::RemoteIo("Permission denied".into()));
        assert_eq!(err.kind(), "remote_io");

        let err = TransferError::from_open("/etc/x", GatewayError::Transport("closed".into()));
        assert_eq!(err.kind(), "transport");
    }

    #[test]
    fn test_serializes_as_message() {
        let json = serde_json::to_string(&TransferError::InvalidPath("a\0b".into())).unwrap();
        assert!(json.starts_with("\"Invalid path"));
    }
}
