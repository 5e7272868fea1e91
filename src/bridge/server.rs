//! WebSocket server for the streaming surface
//!
//! Two paths share one listener:
//!
//! - `/ws/ssh`: interactive sessions. The socket reader parses frames into
//!   [`ClientMessage`]s for the session actor; a writer task serializes the
//!   actor's [`ServerMessage`]s back out.
//! - `/ws/ssh/execute`: one `execute` message, streamed output, `completed`,
//!   then close.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::limiter::{ClientLimiter, ClientPermit};
use super::protocol::{ClientMessage, ExecutePayload, ServerMessage};
use crate::exec::{CommandOutcome, CommandPipeline, ExecOptions, OutputStream, TIMEOUT_EXIT_CODE};
use crate::registry::LeaseMode;
use crate::session::{InteractiveSession, SessionContext};

pub const INTERACTIVE_PATH: &str = "/ws/ssh";
pub const EXECUTE_PATH: &str = "/ws/ssh/execute";

/// How long the one-shot path waits for its `execute` message
const FIRST_MESSAGE_TIMEOUT: Duration = Duration::from_secs(30);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Why a streaming channel ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Client closed the socket or sent `disconnect`
    ClientClosed,
    /// Session reached `Closed` on its own (error, idle, shutdown)
    SessionClosed,
    /// Per-client channel cap reached
    Rejected,
    /// WebSocket protocol error
    ProtocolError,
}

enum Route {
    Interactive,
    Execute,
}

/// Streaming surface listener
pub struct WsBridge {
    ctx: SessionContext,
    limiter: Arc<ClientLimiter>,
    max_message_bytes: usize,
}

impl WsBridge {
    pub fn new(ctx: SessionContext, max_sessions_per_client: usize, max_message_bytes: usize) -> Self {
        Self {
            ctx,
            limiter: Arc::new(ClientLimiter::new(max_sessions_per_client)),
            max_message_bytes,
        }
    }

    /// Accept connections until process shutdown
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        match listener.local_addr() {
            Ok(addr) => info!("WebSocket bridge listening on {}", addr),
            Err(e) => warn!("WebSocket bridge listening (address unknown: {})", e),
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let bridge = self.clone();
                        tokio::spawn(async move {
                            let reason = bridge.handle_connection(stream, peer).await;
                            debug!("[bridge] {} disconnected: {:?}", peer, reason);
                        });
                    }
                    Err(e) => warn!("[bridge] accept failed: {}", e),
                },
                _ = self.ctx.shutdown.cancelled() => break,
            }
        }
        info!("WebSocket bridge stopped");
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> DisconnectReason {
        let mut path = String::new();
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            path = req.uri().path().trim_end_matches('/').to_string();
            if path == INTERACTIVE_PATH || path == EXECUTE_PATH {
                Ok(resp)
            } else {
                let mut err = ErrorResponse::new(Some(format!("no such endpoint: {}", path)));
                *err.status_mut() = StatusCode::NOT_FOUND;
                Err(err)
            }
        };

        let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!("[bridge] handshake with {} failed: {}", peer, e);
                return DisconnectReason::ProtocolError;
            }
        };
        let route = if path == EXECUTE_PATH {
            Route::Execute
        } else {
            Route::Interactive
        };

        let (mut sink, source) = ws.split();
        let Some(permit) = self.limiter.try_acquire(peer.ip()) else {
            send(&mut sink, &ServerMessage::error_with_kind("too many connections", "policy_denied")).await;
            let _ = sink.close().await;
            return DisconnectReason::Rejected;
        };

        match route {
            Route::Interactive => self.run_interactive(sink, source, peer, permit).await,
            Route::Execute => self.run_execute(sink, source, peer, permit).await,
        }
    }

    async fn run_interactive(
        &self,
        mut sink: WsSink,
        mut source: WsSource,
        peer: SocketAddr,
        _permit: ClientPermit,
    ) -> DisconnectReason {
        let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(256);
        let (in_tx, in_rx) = mpsc::channel::<ClientMessage>(64);
        let replies = out_tx.downgrade();

        let session = InteractiveSession::new(self.ctx.clone(), Some(peer), out_tx);
        let session_id = session.id().to_string();
        let session_task = tokio::spawn(session.run(in_rx));
        info!("[bridge] {} opened session {}", peer, session_id);

        let session_done = CancellationToken::new();
        let writer_done = session_done.clone();
        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if !send(&mut sink, &message).await {
                    break;
                }
            }
            let _ = sink.close().await;
            writer_done.cancel();
        });

        let reason = loop {
            let frame = tokio::select! {
                frame = source.next() => frame,
                _ = session_done.cancelled() => break DisconnectReason::SessionClosed,
            };

            match frame {
                Some(Ok(Message::Text(text))) => {
                    match ClientMessage::parse(&text, self.max_message_bytes) {
                        Ok(message) => {
                            if in_tx.send(message).await.is_err() {
                                break DisconnectReason::SessionClosed;
                            }
                        }
                        Err(e) => {
                            debug!("[bridge] session {} rejected frame: {}", session_id, e);
                            if let Some(tx) = replies.upgrade() {
                                let _ = tx.send(ServerMessage::error_with_kind(e.to_string(), "invalid_request")).await;
                            }
                        }
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    if let Some(tx) = replies.upgrade() {
                        let _ = tx
                            .send(ServerMessage::error_with_kind("binary frames are not supported", "invalid_request"))
                            .await;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break DisconnectReason::ClientClosed,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("[bridge] session {} socket error: {}", session_id, e);
                    break DisconnectReason::ProtocolError;
                }
            }
        };

        // Dropping the inbound sender closes the session if it is still open
        drop(in_tx);
        let _ = session_task.await;
        let _ = writer.await;
        reason
    }

    async fn run_execute(
        &self,
        mut sink: WsSink,
        mut source: WsSource,
        peer: SocketAddr,
        _permit: ClientPermit,
    ) -> DisconnectReason {
        let first = tokio::time::timeout(FIRST_MESSAGE_TIMEOUT, next_text(&mut source)).await;
        let reason = match first {
            Ok(Some(text)) => match ClientMessage::parse(&text, self.max_message_bytes) {
                Ok(ClientMessage::Execute(payload)) => {
                    self.stream_execution(payload, peer, &mut sink, &mut source).await
                }
                Ok(other) => {
                    let text = format!("message type must be execute, got {}", other.kind());
                    send(&mut sink, &ServerMessage::error_with_kind(text, "invalid_request")).await;
                    DisconnectReason::ProtocolError
                }
                Err(e) => {
                    send(&mut sink, &ServerMessage::error_with_kind(e.to_string(), "invalid_request")).await;
                    DisconnectReason::ProtocolError
                }
            },
            Ok(None) => DisconnectReason::ClientClosed,
            Err(_) => {
                send(&mut sink, &ServerMessage::error_with_kind("no execute message received", "timeout")).await;
                DisconnectReason::ProtocolError
            }
        };
        let _ = sink.close().await;
        reason
    }

    async fn stream_execution(
        &self,
        payload: ExecutePayload,
        peer: SocketAddr,
        sink: &mut WsSink,
        source: &mut WsSource,
    ) -> DisconnectReason {
        let key = match payload.connection.to_key() {
            Ok(key) => key,
            Err(e) => {
                send(sink, &ServerMessage::error_with_kind(e.to_string(), e.kind())).await;
                return DisconnectReason::SessionClosed;
            }
        };
        let lease = match self
            .ctx
            .registry
            .lease_for_client(&key, LeaseMode::Shared, Some(peer.ip()))
            .await
        {
            Ok(lease) => lease,
            Err(e) => {
                warn!(
                    target: "ssh_gateway::audit",
                    client = %peer,
                    endpoint = %key.endpoint(),
                    error = %e,
                    "streaming execute connect failed"
                );
                send(sink, &ServerMessage::error_with_kind(e.to_string(), e.kind())).await;
                return DisconnectReason::SessionClosed;
            }
        };

        let timeout = self.ctx.config.command_timeout(payload.timeout);
        let (chunk_tx, mut chunk_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let execution = CommandPipeline::execute(
            &lease,
            &payload.command,
            timeout,
            ExecOptions {
                pty: None,
                sink: Some(chunk_tx),
                cancel: cancel.clone(),
            },
        );
        tokio::pin!(execution);

        let mut client_open = true;
        let result = loop {
            tokio::select! {
                result = &mut execution => break result,
                Some(chunk) = chunk_rx.recv() => {
                    let message = match chunk.stream {
                        OutputStream::Stdout => ServerMessage::output(chunk.text()),
                        OutputStream::Stderr => ServerMessage::stderr(chunk.text()),
                    };
                    if client_open && !send(sink, &message).await {
                        client_open = false;
                        cancel.cancel();
                    }
                }
                frame = source.next(), if client_open => {
                    if matches!(frame, None | Some(Err(_)) | Some(Ok(Message::Close(_)))) {
                        debug!("[bridge] {} left during execute, cancelling", peer);
                        client_open = false;
                        cancel.cancel();
                    }
                }
            }
        };

        if !client_open {
            return DisconnectReason::ClientClosed;
        }
        while let Ok(chunk) = chunk_rx.try_recv() {
            let message = match chunk.stream {
                OutputStream::Stdout => ServerMessage::output(chunk.text()),
                OutputStream::Stderr => ServerMessage::stderr(chunk.text()),
            };
            send(sink, &message).await;
        }

        let last = match result {
            Ok(execution) => match execution.outcome {
                Some(CommandOutcome::Exited(exit_code)) => ServerMessage::Completed {
                    exit_code,
                    timed_out: false,
                },
                Some(CommandOutcome::TimedOut) => ServerMessage::Completed {
                    exit_code: TIMEOUT_EXIT_CODE,
                    timed_out: true,
                },
                Some(CommandOutcome::TransportFailed(e)) => {
                    ServerMessage::error_with_kind(e.to_string(), e.kind())
                }
                Some(CommandOutcome::Cancelled) | None => return DisconnectReason::ClientClosed,
            },
            Err(e) => ServerMessage::error_with_kind(e.to_string(), e.kind()),
        };
        send(sink, &last).await;
        DisconnectReason::SessionClosed
    }
}

/// Next text frame, skipping control frames. `None` once the client is gone.
async fn next_text(source: &mut WsSource) -> Option<String> {
    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => return Some(text),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

/// Returns `false` once the socket can no longer be written
async fn send(sink: &mut WsSink, message: &ServerMessage) -> bool {
    sink.send(Message::Text(message.to_json())).await.is_ok()
}
