//! Transport seams
//!
//! The registry and both pipelines only talk to remote hosts through these
//! traits. [`super::client`] provides the russh implementation; tests plug in
//! a scripted in-memory one.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use super::key::{ConnectionKey, TerminalSize};
use crate::error::GatewayError;

/// Byte source for a remote file
pub type RemoteReader = Pin<Box<dyn AsyncRead + Send>>;

/// Byte sink for a remote file
pub type RemoteWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Something that arrived on an exec channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Stdout(Bytes),
    Stderr(Bytes),
    /// Remote process exit status
    Exit(i32),
}

/// One running remote command
#[async_trait]
pub trait ExecChannel: Send {
    /// Wait for the next event.
    ///
    /// `Ok(None)` means the channel finished normally; `Err` means the
    /// underlying connection went away mid-command.
    async fn next_event(&mut self) -> Result<Option<ExecEvent>, GatewayError>;

    /// Apply new terminal geometry (no-op for channels without a PTY)
    async fn resize(&mut self, size: TerminalSize) -> Result<(), GatewayError>;

    /// Best-effort termination of the remote process and the channel
    async fn terminate(&mut self);
}

/// A live, authenticated session to one remote host
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Cheap round trip proving the session still answers
    async fn is_alive(&self) -> bool;

    /// Whether independent channels may run concurrently on this session.
    /// When `false` the registry serializes shared leases.
    fn is_multiplexed(&self) -> bool {
        true
    }

    /// Start `command`, optionally on a PTY of the given size
    async fn open_exec(
        &self,
        command: &str,
        pty: Option<TerminalSize>,
    ) -> Result<Box<dyn ExecChannel>, GatewayError>;

    async fn open_read(&self, path: &str) -> Result<RemoteReader, GatewayError>;

    /// Create or truncate `path` for writing
    async fn open_write(&self, path: &str) -> Result<RemoteWriter, GatewayError>;

    async fn close(&self);
}

/// Establishes authenticated transports
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// Connect and authenticate.
    ///
    /// Fails with [`GatewayError::Authentication`] on rejected credentials and
    /// [`GatewayError::Connect`] when the host cannot be reached in time.
    async fn connect(&self, key: &ConnectionKey) -> Result<Arc<dyn RemoteTransport>, GatewayError>;
}
