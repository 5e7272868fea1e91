//! russh-backed transport
//!
//! One [`RusshTransport`] wraps one authenticated `russh::client::Handle`.
//! Every command runs on its own session channel, so a single transport
//! multiplexes any number of concurrent exec and SFTP operations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, Handle, Msg};
use russh::keys::{decode_secret_key, load_secret_key, PrivateKey, PrivateKeyWithHashAlg};
use russh::{Channel, ChannelMsg, Disconnect, Sig};
use russh_sftp::client::SftpSession;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::key::{ConnectionKey, Credential, TerminalSize};
use super::transport::{
    ExecChannel, ExecEvent, RemoteConnector, RemoteReader, RemoteTransport, RemoteWriter,
};
use crate::error::GatewayError;

/// Deadline for the liveness round trip
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(5);

/// Protocol-level keepalive while a connection sits in the pool
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

const TERM_TYPE: &str = "xterm-256color";

/// russh client handler. Host keys are accepted on first sight; the gateway
/// has no known_hosts store of its own.
struct ClientHandler {
    endpoint: String,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(
            "Accepting {} host key for {}",
            server_public_key.algorithm(),
            self.endpoint
        );
        Ok(true)
    }
}

/// Opens russh transports
pub struct RusshConnector {
    connect_timeout: Duration,
}

impl RusshConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn handshake(&self, key: &ConnectionKey) -> Result<Handle<ClientHandler>, GatewayError> {
        let config = Arc::new(client::Config {
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            keepalive_max: 3,
            ..Default::default()
        });
        let handler = ClientHandler {
            endpoint: key.endpoint(),
        };
        let addr = (key.host().to_string(), key.port());

        let mut handle = timeout(self.connect_timeout, client::connect(config, addr, handler))
            .await
            .map_err(|_| {
                GatewayError::Connect(format!(
                    "{} did not answer within {}s",
                    key.endpoint(),
                    self.connect_timeout.as_secs()
                ))
            })?
            .map_err(|e| GatewayError::Connect(format!("{}: {}", key.endpoint(), e)))?;

        let auth = match key.credential() {
            Credential::Password { password } => handle
                .authenticate_password(key.username(), password.as_str())
                .await
                .map_err(|e| GatewayError::Connect(e.to_string()))?,
            Credential::KeyFile { path, passphrase } => {
                let secret = load_secret_key(path, passphrase.as_deref()).map_err(|e| {
                    GatewayError::Authentication(format!("cannot load private key {}: {}", path, e))
                })?;
                authenticate_with_key(&mut handle, key.username(), secret).await?
            }
            Credential::KeyContent { pem, passphrase } => {
                let secret = decode_secret_key(pem, passphrase.as_deref()).map_err(|e| {
                    GatewayError::Authentication(format!("cannot decode private key: {}", e))
                })?;
                authenticate_with_key(&mut handle, key.username(), secret).await?
            }
        };

        if !auth.success() {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "authentication failed", "en")
                .await;
            return Err(GatewayError::Authentication(format!(
                "{} rejected {} credentials",
                key.endpoint(),
                key.credential().method()
            )));
        }

        Ok(handle)
    }
}

async fn authenticate_with_key(
    handle: &mut Handle<ClientHandler>,
    username: &str,
    secret: PrivateKey,
) -> Result<client::AuthResult, GatewayError> {
    let hash_alg = handle
        .best_supported_rsa_hash()
        .await
        .map_err(|e| GatewayError::Connect(e.to_string()))?
        .flatten();
    handle
        .authenticate_publickey(username, PrivateKeyWithHashAlg::new(Arc::new(secret), hash_alg))
        .await
        .map_err(|e| GatewayError::Connect(e.to_string()))
}

#[async_trait]
impl RemoteConnector for RusshConnector {
    async fn connect(&self, key: &ConnectionKey) -> Result<Arc<dyn RemoteTransport>, GatewayError> {
        let handle = self.handshake(key).await?;
        info!("SSH session established: {}", key.endpoint());
        Ok(Arc::new(RusshTransport {
            handle,
            sftp: Mutex::new(None),
            endpoint: key.endpoint(),
        }))
    }
}

/// An authenticated russh session
pub struct RusshTransport {
    handle: Handle<ClientHandler>,
    /// Lazily opened SFTP subsystem, shared by all transfers on this session
    sftp: Mutex<Option<Arc<SftpSession>>>,
    endpoint: String,
}

impl RusshTransport {
    async fn open_channel(&self) -> Result<Channel<Msg>, GatewayError> {
        self.handle
            .channel_open_session()
            .await
            .map_err(|e| GatewayError::Transport(format!("channel open failed: {}", e)))
    }

    async fn sftp(&self) -> Result<Arc<SftpSession>, GatewayError> {
        let mut guard = self.sftp.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }

        let channel = self.open_channel().await?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| GatewayError::Transport(format!("sftp subsystem request failed: {}", e)))?;
        let session = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| GatewayError::RemoteIo(format!("SFTP subsystem not available: {}", e)))?;

        debug!("SFTP subsystem opened on {}", self.endpoint);
        let session = Arc::new(session);
        *guard = Some(session.clone());
        Ok(session)
    }

    /// Map an SFTP failure. A dead session is a transport problem, anything
    /// else is about the remote path.
    async fn sftp_error(&self, path: &str, e: russh_sftp::client::error::Error) -> GatewayError {
        if self.handle.is_closed() {
            *self.sftp.lock().await = None;
            GatewayError::Transport(format!("connection lost while opening {}", path))
        } else {
            GatewayError::RemoteIo(format!("{}: {}", path, e))
        }
    }
}

#[async_trait]
impl RemoteTransport for RusshTransport {
    async fn is_alive(&self) -> bool {
        if self.handle.is_closed() {
            return false;
        }
        match timeout(LIVENESS_TIMEOUT, self.handle.channel_open_session()).await {
            Ok(Ok(channel)) => {
                let _ = channel.close().await;
                true
            }
            Ok(Err(e)) => {
                debug!("Liveness check failed for {}: {}", self.endpoint, e);
                false
            }
            Err(_) => {
                debug!("Liveness check timed out for {}", self.endpoint);
                false
            }
        }
    }

    async fn open_exec(
        &self,
        command: &str,
        pty: Option<TerminalSize>,
    ) -> Result<Box<dyn ExecChannel>, GatewayError> {
        let channel = self.open_channel().await?;

        if let Some(size) = pty {
            channel
                .request_pty(false, TERM_TYPE, size.cols as u32, size.rows as u32, 0, 0, &[])
                .await
                .map_err(|e| GatewayError::Transport(format!("pty request failed: {}", e)))?;
        }

        channel
            .exec(true, command)
            .await
            .map_err(|e| GatewayError::Transport(format!("exec failed: {}", e)))?;

        Ok(Box::new(RusshExec {
            channel,
            has_pty: pty.is_some(),
            exited: false,
        }))
    }

    async fn open_read(&self, path: &str) -> Result<RemoteReader, GatewayError> {
        let sftp = self.sftp().await?;
        match sftp.open(path).await {
            Ok(file) => Ok(Box::pin(file)),
            Err(e) => Err(self.sftp_error(path, e).await),
        }
    }

    async fn open_write(&self, path: &str) -> Result<RemoteWriter, GatewayError> {
        let sftp = self.sftp().await?;
        match sftp.create(path).await {
            Ok(file) => Ok(Box::pin(file)),
            Err(e) => Err(self.sftp_error(path, e).await),
        }
    }

    async fn close(&self) {
        self.sftp.lock().await.take();
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "connection closed by gateway", "en")
            .await
        {
            warn!("Error during disconnect from {}: {}", self.endpoint, e);
        }
        info!("SSH session closed: {}", self.endpoint);
    }
}

/// One exec channel
struct RusshExec {
    channel: Channel<Msg>,
    has_pty: bool,
    exited: bool,
}

#[async_trait]
impl ExecChannel for RusshExec {
    async fn next_event(&mut self) -> Result<Option<ExecEvent>, GatewayError> {
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    return Ok(Some(ExecEvent::Stdout(Bytes::copy_from_slice(&data))));
                }
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    return Ok(Some(ExecEvent::Stderr(Bytes::copy_from_slice(&data))));
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    self.exited = true;
                    return Ok(Some(ExecEvent::Exit(exit_status as i32)));
                }
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    self.exited = true;
                    return Ok(Some(ExecEvent::Exit(128 + signal_number(&signal_name))));
                }
                Some(ChannelMsg::Close) => return Ok(None),
                Some(_) => {}
                None if self.exited => return Ok(None),
                None => {
                    return Err(GatewayError::Transport(
                        "connection closed before command finished".into(),
                    ));
                }
            }
        }
    }

    async fn resize(&mut self, size: TerminalSize) -> Result<(), GatewayError> {
        if !self.has_pty {
            return Ok(());
        }
        self.channel
            .window_change(size.cols as u32, size.rows as u32, 0, 0)
            .await
            .map_err(|e| GatewayError::Transport(format!("window change failed: {}", e)))
    }

    async fn terminate(&mut self) {
        // Many servers ignore signal requests; closing the channel hangs up a PTY.
        let _ = self.channel.signal(Sig::KILL).await;
        let _ = self.channel.eof().await;
        let _ = self.channel.close().await;
    }
}

/// Conventional numbers for the signals SSH names
fn signal_number(sig: &Sig) -> i32 {
    match sig {
        Sig::HUP => 1,
        Sig::INT => 2,
        Sig::QUIT => 3,
        Sig::ILL => 4,
        Sig::ABRT => 6,
        Sig::FPE => 8,
        Sig::KILL => 9,
        Sig::USR1 => 10,
        Sig::SEGV => 11,
        Sig::PIPE => 13,
        Sig::ALRM => 14,
        Sig::TERM => 15,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_numbers() {
        assert_eq!(128 + signal_number(&Sig::KILL), 137);
        assert_eq!(128 + signal_number(&Sig::TERM), 143);
        assert_eq!(signal_number(&Sig::Custom("WINCH".into())), 0);
    }
}
