//! Single command execution over a leased connection

use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::registry::Lease;
use crate::ssh::{validate_command, ExecEvent, TerminalSize};

/// Exit status reported for a command that hit its deadline
pub const TIMEOUT_EXIT_CODE: i32 = -1;

/// Which remote stream a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A piece of command output, delivered in generation order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub data: Bytes,
}

impl OutputChunk {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// How a command ended
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    /// Remote process exit status (0 = success)
    Exited(i32),
    /// Deadline elapsed; the remote process was terminated
    TimedOut,
    /// Caller went away; the remote process was terminated
    Cancelled,
    /// Connection dropped mid-command
    TransportFailed(GatewayError),
}

/// Record of one command run. Lives only for the duration of the call.
#[derive(Debug, Clone)]
pub struct CommandExecution {
    pub command: String,
    pub timeout: Duration,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` while running
    pub outcome: Option<CommandOutcome>,
}

impl CommandExecution {
    fn new(command: &str, timeout: Duration) -> Self {
        Self {
            command: command.to_string(),
            timeout,
            started_at: Utc::now(),
            duration: Duration::ZERO,
            stdout: Vec::new(),
            stderr: Vec::new(),
            outcome: None,
        }
    }

    /// Exit status, with [`TIMEOUT_EXIT_CODE`] for timeouts.
    /// `None` for transport failure and cancellation.
    pub fn exit_code(&self) -> Option<i32> {
        match self.outcome {
            Some(CommandOutcome::Exited(code)) => Some(code),
            Some(CommandOutcome::TimedOut) => Some(TIMEOUT_EXIT_CODE),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Some(CommandOutcome::Exited(0)))
    }

    pub fn timed_out(&self) -> bool {
        matches!(self.outcome, Some(CommandOutcome::TimedOut))
    }

    /// The transport error, if the connection dropped mid-command
    pub fn transport_error(&self) -> Option<&GatewayError> {
        match &self.outcome {
            Some(CommandOutcome::TransportFailed(err)) => Some(err),
            _ => None,
        }
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Optional wiring for a streaming caller
#[derive(Default)]
pub struct ExecOptions {
    /// Run on a PTY that follows this geometry
    pub pty: Option<watch::Receiver<TerminalSize>>,
    /// Receives output as it arrives
    pub sink: Option<mpsc::Sender<OutputChunk>>,
    /// Cancels the command (best-effort remote termination)
    pub cancel: CancellationToken,
}

/// Runs commands against leased connections. Never retries.
pub struct CommandPipeline;

impl CommandPipeline {
    /// Run `command` and collect its output (synchronous surface)
    pub async fn execute_collect(
        lease: &Lease,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandExecution, GatewayError> {
        Self::execute(lease, command, timeout, ExecOptions::default()).await
    }

    /// Run `command`, streaming output into `options.sink` while also
    /// capturing it.
    ///
    /// `Err` only when the command could not be started. Once started, every
    /// ending (including transport loss) is reported in the returned record
    /// together with the output captured so far.
    pub async fn execute(
        lease: &Lease,
        command: &str,
        timeout: Duration,
        options: ExecOptions,
    ) -> Result<CommandExecution, GatewayError> {
        validate_command(command)?;

        let ExecOptions {
            pty: mut geometry,
            sink,
            cancel,
        } = options;

        let guard = lease.begin_operation().await;
        let initial = geometry.as_mut().map(|rx| *rx.borrow_and_update());
        let mut channel = guard.transport().open_exec(command, initial).await?;

        let mut exec = CommandExecution::new(command, timeout);
        let started = Instant::now();
        let deadline = tokio::time::sleep_until(started + timeout);
        tokio::pin!(deadline);

        debug!(
            "[exec] {} started on {} (timeout {:?})",
            command,
            lease.key().endpoint(),
            timeout
        );

        let mut exit_status: Option<i32> = None;
        let outcome = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    channel.terminate().await;
                    break CommandOutcome::Cancelled;
                }

                _ = &mut deadline => {
                    warn!("[exec] {} timed out after {:?}", command, timeout);
                    channel.terminate().await;
                    break CommandOutcome::TimedOut;
                }

                Some(size) = geometry_changed(&mut geometry) => {
                    if let Err(e) = channel.resize(size).await {
                        debug!("[exec] resize failed: {}", e);
                    }
                }

                event = channel.next_event() => {
                    let stop = match event {
                        Ok(Some(ExecEvent::Stdout(data))) => {
                            exec.stdout.extend_from_slice(&data);
                            forward(&sink, OutputStream::Stdout, data, &cancel, deadline.as_mut()).await
                        }
                        Ok(Some(ExecEvent::Stderr(data))) => {
                            exec.stderr.extend_from_slice(&data);
                            forward(&sink, OutputStream::Stderr, data, &cancel, deadline.as_mut()).await
                        }
                        Ok(Some(ExecEvent::Exit(code))) => {
                            exit_status = Some(code);
                            None
                        }
                        Ok(None) => match exit_status {
                            Some(code) => break CommandOutcome::Exited(code),
                            None => {
                                warn!("[exec] {} closed without an exit status", command);
                                break CommandOutcome::TransportFailed(GatewayError::Transport(
                                    "channel closed without exit status".into(),
                                ));
                            }
                        },
                        Err(e) => match exit_status {
                            // Status already delivered; losing the tail of the channel is harmless
                            Some(code) => break CommandOutcome::Exited(code),
                            None => {
                                warn!("[exec] {} lost its connection: {}", command, e);
                                break CommandOutcome::TransportFailed(e);
                            }
                        },
                    };

                    // Stopped while waiting on a full sink
                    if let Some(stop) = stop {
                        if matches!(stop, CommandOutcome::TimedOut) {
                            warn!("[exec] {} timed out after {:?}", command, timeout);
                        }
                        channel.terminate().await;
                        break stop;
                    }
                }
            }
        };

        drop(guard);
        exec.duration = started.elapsed();
        info!(
            "[exec] {} finished on {}: {:?} in {:?}",
            command,
            lease.key().endpoint(),
            outcome,
            exec.duration
        );
        exec.outcome = Some(outcome);
        Ok(exec)
    }
}

async fn geometry_changed(rx: &mut Option<watch::Receiver<TerminalSize>>) -> Option<TerminalSize> {
    let Some(receiver) = rx.as_mut() else {
        return std::future::pending().await;
    };
    if receiver.changed().await.is_ok() {
        return Some(*receiver.borrow_and_update());
    }
    // Geometry owner is gone; keep the current size
    *rx = None;
    None
}

/// Hand one chunk to the sink. The send races `cancel` and the deadline;
/// `Some` names whichever fired first.
async fn forward(
    sink: &Option<mpsc::Sender<OutputChunk>>,
    stream: OutputStream,
    data: Bytes,
    cancel: &CancellationToken,
    deadline: Pin<&mut Sleep>,
) -> Option<CommandOutcome> {
    let tx = sink.as_ref()?;
    tokio::select! {
        biased;

        _ = cancel.cancelled() => Some(CommandOutcome::Cancelled),
        _ = deadline => Some(CommandOutcome::TimedOut),
        // A dropped receiver means nobody is listening any more; capture continues
        _ = tx.send(OutputChunk { stream, data }) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionRegistry, LeaseMode, RegistryConfig};
    use crate::testing::{password_key, MockConnector};
    use std::sync::Arc;

    async fn setup(connector: MockConnector) -> (Arc<MockConnector>, Arc<ConnectionRegistry>) {
        let connector = Arc::new(connector);
        let registry = Arc::new(ConnectionRegistry::new(
            connector.clone(),
            RegistryConfig::default(),
        ));
        (connector, registry)
    }

    #[tokio::test]
    async fn test_echo_hello() {
        let (_, registry) = setup(MockConnector::new()).await;
        let lease = registry.lease(&password_key("h"), LeaseMode::Shared).await.unwrap();

        let exec = CommandPipeline::execute_collect(&lease, "echo hello", Duration::from_secs(5))
            .await
            .unwrap();

        assert!(exec.is_success());
        assert_eq!(exec.stdout_text(), "hello\n");
        assert_eq!(exec.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_not_transport_failure() {
        let (_, registry) = setup(MockConnector::new()).await;
        let lease = registry.lease(&password_key("h"), LeaseMode::Shared).await.unwrap();

        let exec = CommandPipeline::execute_collect(&lease, "ls /nonexistent", Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(exec.exit_code(), Some(2));
        assert!(exec.transport_error().is_none());
        assert!(exec.stderr_text().contains("No such file"));
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let (connector, registry) = setup(MockConnector::new()).await;
        let lease = registry.lease(&password_key("h"), LeaseMode::Shared).await.unwrap();

        let started = std::time::Instant::now();
        let exec = CommandPipeline::execute_collect(
            &lease,
            "echo started; sleep 100",
            Duration::from_millis(200),
        )
        .await
        .unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(exec.timed_out());
        assert_eq!(exec.exit_code(), Some(TIMEOUT_EXIT_CODE));
        assert_eq!(exec.stdout_text(), "started\n");
        assert_eq!(connector.terminated_count(), 1);
    }

    #[tokio::test]
    async fn test_connection_drop_reports_partial_output() {
        let (_, registry) = setup(MockConnector::new()).await;
        let lease = registry.lease(&password_key("h"), LeaseMode::Shared).await.unwrap();

        let exec = CommandPipeline::execute_collect(&lease, "echo partial; reboot", Duration::from_secs(5))
            .await
            .unwrap();

        assert!(matches!(exec.transport_error(), Some(GatewayError::Transport(_))));
        assert_eq!(exec.exit_code(), None);
        assert_eq!(exec.stdout_text(), "partial\n");
    }

    #[tokio::test]
    async fn test_close_without_exit_status_is_transport_failure() {
        let (_, registry) = setup(MockConnector::new()).await;
        let lease = registry.lease(&password_key("h"), LeaseMode::Shared).await.unwrap();

        let exec = CommandPipeline::execute_collect(&lease, "echo bye; hangup", Duration::from_secs(5))
            .await
            .unwrap();

        match exec.transport_error() {
            Some(GatewayError::Transport(msg)) => assert!(msg.contains("without exit status")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(exec.exit_code(), None);
        assert!(!exec.is_success());
        assert_eq!(exec.stdout_text(), "bye\n");
    }

    #[tokio::test]
    async fn test_full_sink_still_times_out() {
        let (connector, registry) = setup(MockConnector::new()).await;
        let lease = registry.lease(&password_key("h"), LeaseMode::Shared).await.unwrap();
        // Room for one chunk, never read
        let (tx, _rx) = mpsc::channel(1);

        let started = std::time::Instant::now();
        let exec = CommandPipeline::execute(
            &lease,
            "echo a; echo b; echo c; sleep 100",
            Duration::from_millis(300),
            ExecOptions {
                sink: Some(tx),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(exec.timed_out());
        assert_eq!(connector.terminated_count(), 1);
        assert_eq!(exec.stdout_text(), "a\nb\n");
    }

    #[tokio::test]
    async fn test_full_sink_still_cancels() {
        let (connector, registry) = setup(MockConnector::new()).await;
        let lease = registry.lease(&password_key("h"), LeaseMode::Shared).await.unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let exec = CommandPipeline::execute(
            &lease,
            "echo a; echo b; sleep 100",
            Duration::from_secs(30),
            ExecOptions {
                sink: Some(tx),
                cancel,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert!(matches!(exec.outcome, Some(CommandOutcome::Cancelled)));
        assert_eq!(connector.terminated_count(), 1);
    }

    #[tokio::test]
    async fn test_streams_in_order() {
        let (_, registry) = setup(MockConnector::new()).await;
        let lease = registry.lease(&password_key("h"), LeaseMode::Shared).await.unwrap();
        let (tx, mut rx) = mpsc::channel(16);

        let exec = CommandPipeline::execute(
            &lease,
            "seq 3",
            Duration::from_secs(5),
            ExecOptions {
                sink: Some(tx),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let mut streamed = String::new();
        while let Ok(chunk) = rx.try_recv() {
            assert_eq!(chunk.stream, OutputStream::Stdout);
            streamed.push_str(&chunk.text());
        }
        assert_eq!(streamed, "1\n2\n3\n");
        assert_eq!(exec.stdout_text(), streamed);
    }

    #[tokio::test]
    async fn test_cancel_terminates() {
        let (connector, registry) = setup(MockConnector::new()).await;
        let lease = registry.lease(&password_key("h"), LeaseMode::Shared).await.unwrap();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let exec = CommandPipeline::execute(
            &lease,
            "sleep 10",
            Duration::from_secs(30),
            ExecOptions {
                cancel,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert!(matches!(exec.outcome, Some(CommandOutcome::Cancelled)));
        assert_eq!(connector.terminated_count(), 1);
    }

    #[tokio::test]
    async fn test_resize_reaches_running_command() {
        let (connector, registry) = setup(MockConnector::new()).await;
        let lease = registry.lease(&password_key("h"), LeaseMode::Exclusive).await.unwrap();
        let (size_tx, size_rx) = watch::channel(TerminalSize { cols: 80, rows: 24 });

        let resize = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            size_tx.send_replace(TerminalSize { cols: 120, rows: 40 });
            size_tx
        });

        let exec = CommandPipeline::execute(
            &lease,
            "stty size; sleep 0.2",
            Duration::from_secs(5),
            ExecOptions {
                pty: Some(size_rx),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        drop(resize.await.unwrap());

        assert_eq!(exec.stdout_text(), "24 80\n");
        assert_eq!(connector.resizes(), vec![TerminalSize { cols: 120, rows: 40 }]);
    }

    #[tokio::test]
    async fn test_rejects_invalid_command() {
        let (_, registry) = setup(MockConnector::new()).await;
        let lease = registry.lease(&password_key("h"), LeaseMode::Shared).await.unwrap();
        let err = CommandPipeline::execute_collect(&lease, "  ", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
    }

    #[tokio::test]
    async fn test_concurrent_shared_executes() {
        for connector in [MockConnector::new(), MockConnector::new().single_channel()] {
            let (connector, registry) = setup(connector).await;
            let key = password_key("shared");

            let run = |word: &'static str| {
                let registry = registry.clone();
                let key = key.clone();
                async move {
                    let lease = registry.lease(&key, LeaseMode::Shared).await.unwrap();
                    let cmd = format!("echo {}; sleep 0.05; echo {}", word, word);
                    CommandPipeline::execute_collect(&lease, &cmd, Duration::from_secs(5))
                        .await
                        .unwrap()
                }
            };

            let (a, b) = tokio::join!(run("alpha"), run("beta"));
            assert_eq!(a.stdout_text(), "alpha\nalpha\n");
            assert_eq!(b.stdout_text(), "beta\nbeta\n");
            assert_eq!(connector.connect_count(), 1);
        }
    }
}
