//! Scripted in-memory remote hosts for tests
//!
//! [`MockConnector`] stands in for the russh connector. Its transports run a
//! tiny shell that understands a handful of commands (`echo`, `printf`,
//! `sleep`, `seq`, `exit`, `stty size`, ...) separated by `;`, and share one
//! in-memory filesystem per connector.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;

use crate::error::GatewayError;
use crate::ssh::{
    ConnectionKey, Credential, ExecChannel, ExecEvent, RemoteConnector, RemoteReader,
    RemoteTransport, RemoteWriter, TerminalSize,
};

pub const PASSWORD: &str = "secret";

pub fn key_with_password(host: &str, password: &str) -> ConnectionKey {
    ConnectionKey::new(
        host,
        22,
        "user",
        Credential::Password {
            password: password.to_string(),
        },
    )
    .unwrap()
}

pub fn password_key(host: &str) -> ConnectionKey {
    key_with_password(host, PASSWORD)
}

#[derive(Default)]
struct Stats {
    connects: AtomicUsize,
    closes: AtomicUsize,
    use_after_close: AtomicUsize,
    resizes: Mutex<Vec<TerminalSize>>,
    terminated: AtomicUsize,
}

#[derive(Default)]
struct RemoteFs {
    files: Mutex<HashMap<String, Vec<u8>>>,
    /// Transfers fail once this many bytes have moved
    fail_after: Mutex<Option<usize>>,
}

pub struct MockConnector {
    stats: Arc<Stats>,
    fs: Arc<RemoteFs>,
    multiplexed: bool,
    transports: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            stats: Arc::default(),
            fs: Arc::default(),
            multiplexed: true,
            transports: Mutex::new(Vec::new()),
        }
    }

    /// Transports that cannot run channels concurrently
    pub fn single_channel(mut self) -> Self {
        self.multiplexed = false;
        self
    }

    pub fn connect_count(&self) -> usize {
        self.stats.connects.load(Ordering::SeqCst)
    }

    pub fn closed_count(&self) -> usize {
        self.stats.closes.load(Ordering::SeqCst)
    }

    /// Operations attempted on a transport after it was closed
    pub fn use_after_close(&self) -> usize {
        self.stats.use_after_close.load(Ordering::SeqCst)
    }

    pub fn resizes(&self) -> Vec<TerminalSize> {
        self.stats.resizes.lock().clone()
    }

    pub fn terminated_count(&self) -> usize {
        self.stats.terminated.load(Ordering::SeqCst)
    }

    /// Drop every established connection, as a network outage would
    pub fn kill_all(&self) {
        for transport in self.transports.lock().iter() {
            transport.alive.store(false, Ordering::SeqCst);
        }
    }

    pub fn put_file(&self, path: &str, contents: &[u8]) {
        self.fs.files.lock().insert(path.to_string(), contents.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.fs.files.lock().get(path).cloned()
    }

    pub fn fail_transfers_after(&self, bytes: usize) {
        *self.fs.fail_after.lock() = Some(bytes);
    }
}

#[async_trait]
impl RemoteConnector for MockConnector {
    async fn connect(&self, key: &ConnectionKey) -> Result<Arc<dyn RemoteTransport>, GatewayError> {
        if key.host() == "unreachable" {
            return Err(GatewayError::Connect(format!(
                "failed to connect to {}: connection refused",
                key.endpoint()
            )));
        }
        if let Credential::Password { password } = key.credential() {
            if password != PASSWORD {
                return Err(GatewayError::Authentication(format!(
                    "authentication rejected for {}",
                    key.endpoint()
                )));
            }
        }

        self.stats.connects.fetch_add(1, Ordering::SeqCst);
        let transport = Arc::new(MockTransport {
            alive: Arc::new(AtomicBool::new(true)),
            closed: AtomicBool::new(false),
            multiplexed: self.multiplexed,
            stats: self.stats.clone(),
            fs: self.fs.clone(),
        });
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

pub struct MockTransport {
    alive: Arc<AtomicBool>,
    closed: AtomicBool,
    multiplexed: bool,
    stats: Arc<Stats>,
    fs: Arc<RemoteFs>,
}

impl MockTransport {
    fn check_open(&self) -> Result<(), GatewayError> {
        if self.closed.load(Ordering::SeqCst) {
            self.stats.use_after_close.fetch_add(1, Ordering::SeqCst);
            return Err(GatewayError::Transport("connection closed".into()));
        }
        if !self.alive.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("connection reset by peer".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteTransport for MockTransport {
    async fn is_alive(&self) -> bool {
        self.check_open().is_ok()
    }

    fn is_multiplexed(&self) -> bool {
        self.multiplexed
    }

    async fn open_exec(
        &self,
        command: &str,
        pty: Option<TerminalSize>,
    ) -> Result<Box<dyn ExecChannel>, GatewayError> {
        self.check_open()?;
        Ok(Box::new(MockExec {
            steps: script(command, pty),
            alive: self.alive.clone(),
            stats: self.stats.clone(),
            sleeping_until: None,
            has_pty: pty.is_some(),
        }))
    }

    async fn open_read(&self, path: &str) -> Result<RemoteReader, GatewayError> {
        self.check_open()?;
        let data = self
            .fs
            .files
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| GatewayError::RemoteIo(format!("{}: No such file", path)))?;
        Ok(Box::pin(MockReader {
            data,
            pos: 0,
            fail_after: *self.fs.fail_after.lock(),
        }))
    }

    async fn open_write(&self, path: &str) -> Result<RemoteWriter, GatewayError> {
        self.check_open()?;
        if path.starts_with("/readonly/") {
            return Err(GatewayError::RemoteIo(format!("{}: Permission denied", path)));
        }
        self.fs.files.lock().insert(path.to_string(), Vec::new());
        Ok(Box::pin(MockWriter {
            fs: self.fs.clone(),
            path: path.to_string(),
            pending: Vec::new(),
            written: 0,
            fail_after: *self.fs.fail_after.lock(),
        }))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.stats.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

enum Step {
    Emit(ExecEvent),
    Sleep(Duration),
    /// Connection drops mid-command
    Drop,
}

/// Translate a command line into scripted channel events
fn script(command: &str, pty: Option<TerminalSize>) -> VecDeque<Step> {
    let mut steps = VecDeque::new();
    let mut status = 0;

    for part in command.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (program, arg) = part.split_once(' ').unwrap_or((part, ""));
        let out = |text: String| Step::Emit(ExecEvent::Stdout(Bytes::from(text)));
        let err = |text: String| Step::Emit(ExecEvent::Stderr(Bytes::from(text)));

        status = 0;
        match program {
            "echo" => steps.push_back(out(format!("{}\n", arg))),
            "printf" => steps.push_back(out(arg.to_string())),
            "sleep" => {
                let secs: f64 = arg.parse().unwrap_or(0.0);
                steps.push_back(Step::Sleep(Duration::from_secs_f64(secs)));
            }
            "seq" => {
                let n: u32 = arg.parse().unwrap_or(0);
                for i in 1..=n {
                    steps.push_back(out(format!("{}\n", i)));
                    steps.push_back(Step::Sleep(Duration::from_millis(5)));
                }
            }
            "exit" => {
                steps.push_back(Step::Emit(ExecEvent::Exit(arg.parse().unwrap_or(0))));
                return steps;
            }
            "true" => {}
            "false" => status = 1,
            "tty" => match pty {
                Some(_) => steps.push_back(out("/dev/pts/0\n".into())),
                None => {
                    steps.push_back(out("not a tty\n".into()));
                    status = 1;
                }
            },
            "stty" if arg == "size" => match pty {
                Some(size) => steps.push_back(out(format!("{} {}\n", size.rows, size.cols))),
                None => {
                    steps.push_back(err("stty: 'standard input': Inappropriate ioctl for device\n".into()));
                    status = 1;
                }
            },
            "ls" if arg.starts_with("/nonexistent") => {
                steps.push_back(err(format!(
                    "ls: cannot access '{}': No such file or directory\n",
                    arg
                )));
                status = 2;
            }
            "reboot" => {
                steps.push_back(Step::Drop);
                return steps;
            }
            // Channel closes cleanly but the server never sends a status
            "hangup" => return steps,
            _ => {
                steps.push_back(err(format!("bash: {}: command not found\n", program)));
                status = 127;
            }
        }
    }

    steps.push_back(Step::Emit(ExecEvent::Exit(status)));
    steps
}

struct MockExec {
    steps: VecDeque<Step>,
    alive: Arc<AtomicBool>,
    stats: Arc<Stats>,
    /// Pending sleep survives a cancelled `next_event` future
    sleeping_until: Option<Instant>,
    has_pty: bool,
}

#[async_trait]
impl ExecChannel for MockExec {
    async fn next_event(&mut self) -> Result<Option<ExecEvent>, GatewayError> {
        loop {
            if let Some(deadline) = self.sleeping_until {
                tokio::time::sleep_until(deadline).await;
                self.sleeping_until = None;
            }
            if !self.alive.load(Ordering::SeqCst) {
                return Err(GatewayError::Transport("connection reset by peer".into()));
            }
            match self.steps.pop_front() {
                None => return Ok(None),
                Some(Step::Emit(event)) => return Ok(Some(event)),
                Some(Step::Sleep(duration)) => {
                    self.sleeping_until = Some(Instant::now() + duration);
                }
                Some(Step::Drop) => {
                    self.alive.store(false, Ordering::SeqCst);
                    return Err(GatewayError::Transport("connection reset by peer".into()));
                }
            }
        }
    }

    async fn resize(&mut self, size: TerminalSize) -> Result<(), GatewayError> {
        if self.has_pty {
            self.stats.resizes.lock().push(size);
        }
        Ok(())
    }

    async fn terminate(&mut self) {
        self.steps.clear();
        self.sleeping_until = None;
        self.stats.terminated.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockReader {
    data: Vec<u8>,
    pos: usize,
    fail_after: Option<usize>,
}

impl AsyncRead for MockReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let limit = self.fail_after.unwrap_or(usize::MAX).min(self.data.len());
        if self.pos >= limit && limit < self.data.len() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )));
        }
        let n = buf.remaining().min(limit - self.pos);
        let start = self.pos;
        buf.put_slice(&self.data[start..start + n]);
        self.pos += n;
        Poll::Ready(Ok(()))
    }
}

struct MockWriter {
    fs: Arc<RemoteFs>,
    path: String,
    /// Written but not yet flushed
    pending: Vec<u8>,
    written: usize,
    fail_after: Option<usize>,
}

impl AsyncWrite for MockWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let room = self
            .fail_after
            .map_or(buf.len(), |limit| limit.saturating_sub(self.written));
        if room == 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )));
        }
        let n = room.min(buf.len());
        self.pending.extend_from_slice(&buf[..n]);
        self.written += n;
        Poll::Ready(Ok(n))
    }

    /// Writes reach the remote file only here
    fn poll_flush(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let pending = std::mem::take(&mut self.pending);
        self.fs
            .files
            .lock()
            .entry(self.path.clone())
            .or_default()
            .extend_from_slice(&pending);
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}
