//! Wire Protocol for the streaming surface
//!
//! Every WebSocket text frame carries one JSON message.
//!
//! Client → server: `{"type": <kind>, "data": {...}}`
//!
//! | type          | data                                        |
//! |---------------|---------------------------------------------|
//! | `connect`     | hostname, port, username, password / key     |
//! | `command`     | command, timeout (seconds, optional)         |
//! | `resize`      | cols, rows                                  |
//! | `disconnect`  | –                                           |
//! | `history_get` | direction (`up`/`down`), current_index       |
//! | `execute`     | connection, command, timeout (one-shot path) |
//!
//! Server → client messages are flat objects tagged by `type`:
//! `connected`, `output`, `error`, `completed`, `history_result`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{HistoryDirection, HistoryEntry};
use crate::ssh::{ConnectRequest, TerminalSize};

/// Default maximum inbound message size (256 KB)
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Closed set of client message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum MessageKind {
    Connect,
    Command,
    Resize,
    Disconnect,
    #[serde(alias = "history")]
    HistoryGet,
    Execute,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: MessageKind,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandPayload {
    pub command: String,
    /// Seconds
    #[serde(default)]
    pub timeout: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct ResizePayload {
    #[serde(default = "default_cols")]
    cols: u32,
    #[serde(default = "default_rows")]
    rows: u32,
}

fn default_cols() -> u32 {
    TerminalSize::default().cols as u32
}

fn default_rows() -> u32 {
    TerminalSize::default().rows as u32
}

#[derive(Debug, Clone, Deserialize)]
struct HistoryPayload {
    #[serde(default = "default_direction")]
    direction: HistoryDirection,
    #[serde(default = "default_index")]
    current_index: i64,
}

fn default_direction() -> HistoryDirection {
    HistoryDirection::Up
}

fn default_index() -> i64 {
    -1
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutePayload {
    pub connection: ConnectRequest,
    pub command: String,
    #[serde(default)]
    pub timeout: Option<f64>,
}

/// A parsed client message
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Connect(ConnectRequest),
    Command(CommandPayload),
    Resize(TerminalSize),
    Disconnect,
    HistoryGet {
        direction: HistoryDirection,
        current_index: i64,
    },
    Execute(ExecutePayload),
}

impl ClientMessage {
    /// Parse one text frame
    pub fn parse(text: &str, max_size: usize) -> Result<Self, ProtocolError> {
        if text.len() > max_size {
            return Err(ProtocolError::TooLarge {
                size: text.len(),
                max: max_size,
            });
        }

        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::Invalid(e.to_string()))?;
        let data = envelope.data;

        Ok(match envelope.kind {
            MessageKind::Connect => Self::Connect(payload(data)?),
            MessageKind::Command => Self::Command(payload(data)?),
            MessageKind::Resize => {
                let ResizePayload { cols, rows } = payload(data)?;
                Self::Resize(TerminalSize::clamped(cols, rows))
            }
            MessageKind::Disconnect => Self::Disconnect,
            MessageKind::HistoryGet => {
                let HistoryPayload {
                    direction,
                    current_index,
                } = payload(data)?;
                Self::HistoryGet {
                    direction,
                    current_index,
                }
            }
            MessageKind::Execute => Self::Execute(payload(data)?),
        })
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Command(_) => "command",
            Self::Resize(_) => "resize",
            Self::Disconnect => "disconnect",
            Self::HistoryGet { .. } => "history_get",
            Self::Execute(_) => "execute",
        }
    }
}

fn payload<T: serde::de::DeserializeOwned>(data: serde_json::Value) -> Result<T, ProtocolError> {
    let data = if data.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        data
    };
    serde_json::from_value(data).map_err(|e| ProtocolError::Invalid(e.to_string()))
}

/// Server → client message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        session_id: String,
        message: String,
    },
    Output {
        data: String,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        /// Stderr text on the one-shot path
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_kind: Option<&'static str>,
    },
    Completed {
        exit_code: i32,
        timed_out: bool,
    },
    HistoryResult {
        data: HistoryEntry,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: Some(message.into()),
            data: None,
            error_kind: None,
        }
    }

    pub fn error_with_kind(message: impl Into<String>, kind: &'static str) -> Self {
        Self::Error {
            message: Some(message.into()),
            data: None,
            error_kind: Some(kind),
        }
    }

    pub fn stderr(data: impl Into<String>) -> Self {
        Self::Error {
            message: None,
            data: Some(data.into()),
            error_kind: None,
        }
    }

    pub fn output(data: impl Into<String>) -> Self {
        Self::Output { data: data.into() }
    }

    pub fn to_json(&self) -> String {
        // Only strings, integers and bools inside; serialization cannot fail
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{\"type\":\"error\"}"))
    }
}

/// Rejected inbound messages
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("invalid message: {0}")]
    Invalid(String),
}
