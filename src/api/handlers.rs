//! Route handlers

use std::net::SocketAddr;

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::info;

use super::types::{
    format_uptime, status_for, ApiError, ConnectResponse, ConnectionEntry, ConnectionsResponse,
    DisconnectResponse, ExecuteRequest, ExecuteResponse, TransferRequest, TransferResponse,
};
use super::AppState;
use crate::error::GatewayError;
use crate::exec::{CommandOutcome, CommandPipeline};
use crate::registry::{Lease, LeaseMode};
use crate::ssh::ConnectRequest;

type Client = Option<ConnectInfo<SocketAddr>>;

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload.map(|Json(value)| value).map_err(ApiError::from)
}

async fn lease_for(
    state: &AppState,
    request: &ConnectRequest,
    client: &Client,
) -> Result<Lease, ApiError> {
    let key = request.to_key()?;
    let ip = client.as_ref().map(|ConnectInfo(addr)| addr.ip());
    match state.registry.lease_for_client(&key, LeaseMode::Shared, ip).await {
        Ok(lease) => {
            info!(target: "ssh_gateway::audit", client = ?ip, endpoint = %key.endpoint(), "lease granted");
            Ok(lease)
        }
        Err(err) => {
            info!(target: "ssh_gateway::audit", client = ?ip, endpoint = %key.endpoint(), error = %err, "lease refused");
            Err(err.into())
        }
    }
}

/// GET / - service description
pub async fn index() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "connect": "POST /ssh/connect",
            "execute": "POST /ssh/execute",
            "transfer": "POST /ssh/file/transfer",
            "disconnect": "POST /ssh/disconnect",
            "connections": "GET /ssh/connections",
            "interactive": "WS /ws/ssh",
            "streaming_execute": "WS /ws/ssh/execute",
        },
    }))
}

/// GET /health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /ssh/connect - establish or reuse a pooled connection
pub async fn connect(
    State(state): State<AppState>,
    client: Client,
    payload: Result<Json<ConnectRequest>, JsonRejection>,
) -> Result<Json<ConnectResponse>, ApiError> {
    let request = body(payload)?;
    let lease = lease_for(&state, &request, &client).await?;
    let endpoint = lease.key().endpoint();

    Ok(Json(ConnectResponse {
        success: true,
        message: format!("Connected to {}", endpoint),
        endpoint,
    }))
}

/// POST /ssh/execute - run one command and collect its output
pub async fn execute(
    State(state): State<AppState>,
    client: Client,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request = body(payload)?;
    let timeout = state.limits.command_timeout(request.timeout);
    let lease = lease_for(&state, &request.connection, &client).await?;

    let exec = CommandPipeline::execute_collect(&lease, &request.command, timeout).await?;
    drop(lease);

    let (error_kind, message) = match &exec.outcome {
        Some(CommandOutcome::TimedOut) => {
            let err = GatewayError::Timeout(timeout.as_secs_f64());
            (Some(err.kind()), Some(err.to_string()))
        }
        Some(CommandOutcome::TransportFailed(err)) => (Some(err.kind()), Some(err.to_string())),
        Some(CommandOutcome::Cancelled) => (Some("transport"), Some("Command cancelled".to_string())),
        _ => (None, None),
    };

    let response = ExecuteResponse {
        success: exec.is_success(),
        output: exec.stdout_text(),
        error: exec.stderr_text(),
        exit_code: exec.exit_code(),
        execution_time: exec.duration.as_secs_f64(),
        timed_out: exec.timed_out(),
        error_kind,
        message,
    };

    // A command that ran and exited nonzero is not an HTTP failure
    let status = error_kind.map(status_for).unwrap_or(StatusCode::OK);
    Ok((status, Json(response)).into_response())
}

/// POST /ssh/file/transfer
pub async fn transfer(
    State(state): State<AppState>,
    client: Client,
    payload: Result<Json<TransferRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request = body(payload)?;
    let lease = lease_for(&state, &request.connection, &client).await?;

    let job = state
        .transfers
        .transfer(
            &lease,
            request.direction,
            &request.local_path,
            &request.remote_path,
            None,
        )
        .await;
    drop(lease);

    let response = match job.error() {
        None => TransferResponse {
            success: true,
            bytes_transferred: job.bytes_transferred,
            total_bytes: job.total_bytes,
            message: format!("Transferred {} bytes", job.bytes_transferred),
            error_kind: None,
        },
        Some(err) => TransferResponse {
            success: false,
            bytes_transferred: err.bytes_written(),
            total_bytes: job.total_bytes,
            message: err.to_string(),
            error_kind: Some(err.kind()),
        },
    };

    let status = response.error_kind.map(status_for).unwrap_or(StatusCode::OK);
    Ok((status, Json(response)).into_response())
}

/// POST /ssh/disconnect
pub async fn disconnect(
    State(state): State<AppState>,
    payload: Result<Json<ConnectRequest>, JsonRejection>,
) -> Result<Json<DisconnectResponse>, ApiError> {
    let key = body(payload)?.to_key()?;
    let removed = state.registry.disconnect(&key).await;

    let message = if removed == 0 {
        format!("No pooled connection for {}", key.endpoint())
    } else {
        format!("Disconnected {} ({} connection(s))", key.endpoint(), removed)
    };
    Ok(Json(DisconnectResponse {
        success: true,
        message,
    }))
}

/// GET /ssh/connections - introspection only
pub async fn connections(State(state): State<AppState>) -> Json<ConnectionsResponse> {
    let connections: Vec<ConnectionEntry> = state
        .registry
        .list_active()
        .into_iter()
        .map(|row| ConnectionEntry {
            connection: row.endpoint,
            leases: row.leases,
            exclusive: row.exclusive,
            idle_secs: row.idle_secs,
            uptime: format_uptime(row.uptime_secs),
        })
        .collect();

    Json(ConnectionsResponse {
        count: connections.len(),
        connections,
        sessions: state.manager.list(),
    })
}
