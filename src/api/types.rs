//! Request/response bodies of the HTTP surface

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::bridge::SessionSummary;
use crate::error::GatewayError;
use crate::sftp::TransferDirection;
use crate::ssh::ConnectRequest;

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub connection: ConnectRequest,
    pub command: String,
    /// Seconds; defaulted and clamped by the session limits
    #[serde(default)]
    pub timeout: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub connection: ConnectRequest,
    pub local_path: String,
    pub remote_path: String,
    pub direction: TransferDirection,
}

#[derive(Debug, Serialize)]
pub struct ConnectResponse {
    pub success: bool,
    pub message: String,
    pub endpoint: String,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    /// Exit status 0
    pub success: bool,
    pub output: String,
    /// Captured stderr
    pub error: String,
    /// `-1` on timeout, `null` when the connection dropped
    pub exit_code: Option<i32>,
    /// Seconds
    pub execution_time: f64,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TransferResponse {
    pub success: bool,
    pub bytes_transferred: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct DisconnectResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ConnectionEntry {
    /// `user@host:port`
    pub connection: String,
    pub leases: usize,
    pub exclusive: bool,
    pub idle_secs: u64,
    pub uptime: String,
}

#[derive(Debug, Serialize)]
pub struct ConnectionsResponse {
    pub connections: Vec<ConnectionEntry>,
    pub count: usize,
    pub sessions: Vec<SessionSummary>,
}

/// HTTP status for a wire error kind
pub fn status_for(kind: &str) -> StatusCode {
    match kind {
        "authentication" => StatusCode::UNAUTHORIZED,
        "connect" | "transport" => StatusCode::BAD_GATEWAY,
        "timeout" => StatusCode::GATEWAY_TIMEOUT,
        "invalid_request" => StatusCode::BAD_REQUEST,
        "policy_denied" => StatusCode::FORBIDDEN,
        "busy" => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Structured failure: `{success: false, error_kind, message}`
#[derive(Debug)]
pub struct ApiError {
    pub kind: &'static str,
    pub message: String,
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            kind: "invalid_request",
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "success": false,
            "error_kind": self.kind,
            "message": self.message,
        }));
        (status_for(self.kind), body).into_response()
    }
}

/// Human-readable uptime: "45s", "1m 30s", "1h 1m", "1d 1h"
pub fn format_uptime(secs: u64) -> String {
    match secs {
        0..=59 => format!("{}s", secs),
        60..=3599 => format!("{}m {}s", secs / 60, secs % 60),
        3600..=86_399 => format!("{}h {}m", secs / 3600, (secs % 3600) / 60),
        _ => format!("{}d {}h", secs / 86_400, (secs % 86_400) / 3600),
    }
}
