//! Interactive session actor
//!
//! One task per streaming client. Inbound client messages, command output
//! and command completion are multiplexed through a single `select!` loop,
//! so everything the client sees for a session is emitted from one place
//! and in order.
//!
//! ```text
//!  client msgs ──► ┌──────────────────┐ ──► ServerMessage (outbound)
//!                  │ InteractiveSession│
//!  cmd output  ──► │   select! loop   │
//!  cmd done    ──► └──────────────────┘
//!                        │ spawn per command
//!                        ▼
//!                  CommandPipeline (exclusive lease, PTY follows geometry)
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::history::CommandHistory;
use super::state::SessionStateMachine;
use crate::bridge::{BridgeManager, ClientMessage, CommandPayload, ServerMessage};
use crate::error::GatewayError;
use crate::exec::{CommandExecution, CommandOutcome, CommandPipeline, ExecOptions, OutputChunk};
use crate::registry::{ConnectionRegistry, Lease, LeaseMode};
use crate::ssh::{validate_command, ConnectRequest, TerminalSize};

/// How long `Closing` waits for a cancelled command to report back
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-session limits
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub default_command_timeout: Duration,
    pub max_command_timeout: Duration,
    /// Session closes after this long without client messages while idle
    pub idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_command_timeout: Duration::from_secs(30),
            max_command_timeout: Duration::from_secs(3600),
            idle_timeout: Duration::from_secs(1800),
        }
    }
}

impl SessionConfig {
    /// Caller timeout in seconds, defaulted and clamped
    pub fn command_timeout(&self, requested: Option<f64>) -> Duration {
        match requested {
            Some(secs) if secs.is_finite() && secs > 0.0 => {
                Duration::from_secs_f64(secs).min(self.max_command_timeout)
            }
            _ => self.default_command_timeout,
        }
    }
}

/// Shared collaborators handed to every session
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<ConnectionRegistry>,
    pub manager: Arc<BridgeManager>,
    pub config: SessionConfig,
    /// Process-wide shutdown
    pub shutdown: CancellationToken,
}

struct RunningCommand {
    command: String,
    cancel: CancellationToken,
}

/// State for one streaming-channel client
pub struct InteractiveSession {
    id: String,
    ctx: SessionContext,
    client: Option<SocketAddr>,
    state: SessionStateMachine,
    lease: Option<Arc<Lease>>,
    geometry: watch::Sender<TerminalSize>,
    history: CommandHistory,
    outbound: mpsc::Sender<ServerMessage>,
    /// Set once the client can no longer be written to
    client_gone: bool,
    running: Option<RunningCommand>,
    chunk_tx: mpsc::Sender<OutputChunk>,
    chunk_rx: mpsc::Receiver<OutputChunk>,
    done_tx: mpsc::Sender<Result<CommandExecution, GatewayError>>,
    done_rx: mpsc::Receiver<Result<CommandExecution, GatewayError>>,
    /// Asked to close by the manager or process shutdown
    close_token: CancellationToken,
    last_activity: Instant,
}

impl InteractiveSession {
    pub fn new(ctx: SessionContext, client: Option<SocketAddr>, outbound: mpsc::Sender<ServerMessage>) -> Self {
        let (chunk_tx, chunk_rx) = mpsc::channel(256);
        let (done_tx, done_rx) = mpsc::channel(1);
        let (geometry, _) = watch::channel(TerminalSize::default());
        let close_token = ctx.shutdown.child_token();

        Self {
            id: Uuid::new_v4().to_string(),
            ctx,
            client,
            state: SessionStateMachine::new(),
            lease: None,
            geometry,
            history: CommandHistory::new(),
            outbound,
            client_gone: false,
            running: None,
            chunk_tx,
            chunk_rx,
            done_tx,
            done_rx,
            close_token,
            last_activity: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Drive the session until it reaches `Closed`
    pub async fn run(mut self, mut inbound: mpsc::Receiver<ClientMessage>) {
        debug!("[session {}] started", self.id);

        while !self.state.is_closed() {
            let idle_deadline = self.last_activity + self.ctx.config.idle_timeout;
            let command_running = self.running.is_some();

            tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => {
                        self.last_activity = Instant::now();
                        self.ctx.manager.touch(&self.id);
                        self.handle(message).await;
                    }
                    None => self.close("client channel closed").await,
                },

                Some(chunk) = self.chunk_rx.recv() => {
                    self.emit(ServerMessage::output(chunk.text())).await;
                }

                Some(result) = self.done_rx.recv() => {
                    self.finish_command(result).await;
                }

                _ = tokio::time::sleep_until(idle_deadline), if !command_running => {
                    info!("[session {}] idle for {:?}, closing", self.id, self.ctx.config.idle_timeout);
                    self.close("idle timeout").await;
                }

                _ = self.close_token.cancelled() => {
                    self.close("closed by gateway").await;
                }
            }
        }

        // Whatever the client still sends is dropped with the receiver
        let mut ignored = 0;
        while inbound.try_recv().is_ok() {
            ignored += 1;
        }
        if ignored > 0 {
            debug!("[session {}] ignored {} message(s) after close", self.id, ignored);
        }
        debug!("[session {}] finished", self.id);
    }

    async fn handle(&mut self, message: ClientMessage) {
        if self.state.is_closed() {
            debug!("[session {}] ignoring {} after close", self.id, message.kind());
            return;
        }

        match message {
            ClientMessage::Connect(request) => {
                if self.lease.is_some() {
                    self.emit(ServerMessage::error("already connected")).await;
                } else {
                    self.connect(request).await;
                }
            }
            ClientMessage::Disconnect => self.close("client requested disconnect").await,
            other if !self.state.accepts_commands() => {
                // First message must be `connect`
                let text = format!("expected connect, got {}", other.kind());
                warn!("[session {}] {}", self.id, text);
                self.emit(ServerMessage::error(text)).await;
                self.fail_connect("protocol violation").await;
            }
            ClientMessage::Command(payload) => self.start_command(payload).await,
            ClientMessage::Resize(size) => {
                // Applied at once, even to a running command's PTY
                debug!("[session {}] resize {}x{}", self.id, size.cols, size.rows);
                self.geometry.send_replace(size);
            }
            ClientMessage::HistoryGet {
                direction,
                current_index,
            } => {
                let entry = self.history.navigate(direction, current_index);
                self.emit(ServerMessage::HistoryResult { data: entry }).await;
            }
            ClientMessage::Execute(_) => {
                self.emit(ServerMessage::error("execute is only available on /ws/ssh/execute"))
                    .await;
            }
        }
    }

    async fn connect(&mut self, request: ConnectRequest) {
        let key = match request.to_key() {
            Ok(key) => key,
            Err(e) => {
                self.emit(ServerMessage::error_with_kind(e.to_string(), e.kind())).await;
                self.fail_connect(&e.to_string()).await;
                return;
            }
        };

        let client_ip = self.client.map(|c| c.ip());
        match self
            .ctx
            .registry
            .lease_for_client(&key, LeaseMode::Exclusive, client_ip)
            .await
        {
            Ok(lease) => {
                info!(
                    target: "ssh_gateway::audit",
                    session_id = %self.id,
                    endpoint = %key.endpoint(),
                    client = ?self.client,
                    "interactive session connected"
                );
                self.lease = Some(Arc::new(lease));
                self.geometry.send_replace(request.terminal_size());
                let _ = self.state.authenticated();
                let _ = self.state.activate();

                self.ctx.manager.register(
                    &self.id,
                    key.endpoint(),
                    self.client,
                    self.close_token.clone(),
                );
                self.emit(ServerMessage::Connected {
                    session_id: self.id.clone(),
                    message: format!("Connected to {}", key.endpoint()),
                })
                .await;
            }
            Err(e) => {
                warn!(
                    target: "ssh_gateway::audit",
                    session_id = %self.id,
                    endpoint = %key.endpoint(),
                    client = ?self.client,
                    error = %e,
                    "interactive session connect failed"
                );
                self.emit(ServerMessage::error_with_kind(e.to_string(), e.kind())).await;
                self.fail_connect(&e.to_string()).await;
            }
        }
    }

    async fn start_command(&mut self, payload: CommandPayload) {
        if let Some(running) = &self.running {
            debug!("[session {}] busy with {}", self.id, running.command);
            self.emit(ServerMessage::error(GatewayError::Busy.to_string())).await;
            return;
        }
        if let Err(e) = validate_command(&payload.command) {
            self.emit(ServerMessage::error_with_kind(e.to_string(), e.kind())).await;
            return;
        }
        let Some(lease) = self.lease.clone() else {
            return;
        };

        let command = payload.command.trim().to_string();
        let timeout = self.ctx.config.command_timeout(payload.timeout);
        self.history.push(&command);

        let cancel = CancellationToken::new();
        let options = ExecOptions {
            pty: Some(self.geometry.subscribe()),
            sink: Some(self.chunk_tx.clone()),
            cancel: cancel.clone(),
        };
        let done_tx = self.done_tx.clone();
        let task_command = command.clone();

        tokio::spawn(async move {
            let result = CommandPipeline::execute(&lease, &task_command, timeout, options).await;
            // Release before reporting so a closing session sees the lease gone
            drop(lease);
            let _ = done_tx.send(result).await;
        });

        self.running = Some(RunningCommand { command, cancel });
    }

    /// Emit everything the finished command produced, then its completion
    async fn finish_command(&mut self, result: Result<CommandExecution, GatewayError>) {
        while let Ok(chunk) = self.chunk_rx.try_recv() {
            self.emit(ServerMessage::output(chunk.text())).await;
        }
        self.running = None;

        let execution = match result {
            Ok(execution) => execution,
            Err(e) => {
                self.emit(ServerMessage::error_with_kind(e.to_string(), e.kind())).await;
                if matches!(e, GatewayError::Transport(_)) {
                    self.state.fail(e.to_string());
                    self.close("transport error").await;
                }
                return;
            }
        };

        match execution.outcome {
            Some(CommandOutcome::Exited(exit_code)) => {
                self.emit(ServerMessage::Completed {
                    exit_code,
                    timed_out: false,
                })
                .await;
            }
            Some(CommandOutcome::TimedOut) => {
                self.emit(ServerMessage::Completed {
                    exit_code: crate::exec::TIMEOUT_EXIT_CODE,
                    timed_out: true,
                })
                .await;
            }
            Some(CommandOutcome::TransportFailed(e)) => {
                self.emit(ServerMessage::error_with_kind(e.to_string(), e.kind())).await;
                self.state.fail(e.to_string());
                self.close("transport error").await;
            }
            Some(CommandOutcome::Cancelled) | None => {}
        }
    }

    /// `connect` never succeeded: straight to `Closed`
    async fn fail_connect(&mut self, reason: &str) {
        if self.state.connect_failed(reason.to_string()).is_err() {
            self.close(reason).await;
        }
    }

    /// `Closing` → cancel and drain the in-flight command → release → `Closed`
    async fn close(&mut self, reason: &str) {
        if self.state.is_closed() {
            return;
        }
        // Already Closing when a fatal error got us here
        let _ = self.state.start_closing();
        debug!("[session {}] closing: {}", self.id, reason);

        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            if !self.drain_cancelled().await {
                warn!("[session {}] in-flight command did not stop in time", self.id);
            }
        }

        if let Some(lease) = self.lease.take() {
            info!(
                target: "ssh_gateway::audit",
                session_id = %self.id,
                endpoint = %lease.key().endpoint(),
                reason = reason,
                "interactive session closed"
            );
            drop(lease);
        }
        self.ctx.manager.unregister(&self.id);
        let _ = self.state.close_complete();
    }

    /// Keep forwarding output until the cancelled command reports back.
    /// `false` if it did not within [`DRAIN_TIMEOUT`].
    async fn drain_cancelled(&mut self) -> bool {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        let stopped = loop {
            tokio::select! {
                biased;

                Some(_) = self.done_rx.recv() => break true,

                Some(chunk) = self.chunk_rx.recv() => {
                    let message = ServerMessage::output(chunk.text());
                    if tokio::time::timeout_at(deadline, self.emit(message)).await.is_err() {
                        break false;
                    }
                }

                _ = tokio::time::sleep_until(deadline) => break false,
            }
        };
        if !stopped {
            return false;
        }

        // The pipeline has returned; whatever it queued is final
        while let Ok(chunk) = self.chunk_rx.try_recv() {
            let message = ServerMessage::output(chunk.text());
            if tokio::time::timeout_at(deadline, self.emit(message)).await.is_err() {
                break;
            }
        }
        true
    }

    async fn emit(&mut self, message: ServerMessage) {
        if self.client_gone || self.state.is_closed() {
            return;
        }
        if self.outbound.send(message).await.is_err() {
            self.client_gone = true;
            self.close_token.cancel();
        }
    }
}
