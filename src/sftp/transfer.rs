//! Chunked file transfer over a leased connection

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::error::TransferError;
use crate::registry::Lease;

/// Default chunk size (32 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    /// Local -> remote
    Upload,
    /// Remote -> local
    Download,
}

/// Terminal status of a transfer
#[derive(Debug, Clone)]
pub enum TransferStatus {
    Running,
    Completed,
    Failed(TransferError),
}

/// Cumulative progress, emitted after each chunk reaches the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransferProgress {
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
}

/// Record of one file operation
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub direction: TransferDirection,
    pub local_path: PathBuf,
    pub remote_path: String,
    /// Bytes written to the destination
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
    pub status: TransferStatus,
}

impl TransferJob {
    pub fn is_success(&self) -> bool {
        matches!(self.status, TransferStatus::Completed)
    }

    pub fn error(&self) -> Option<&TransferError> {
        match &self.status {
            TransferStatus::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Which end of the copy failed
enum CopyFailure {
    Source(std::io::Error),
    Destination(std::io::Error),
}

pub struct TransferPipeline {
    chunk_size: usize,
}

impl Default for TransferPipeline {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl TransferPipeline {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Move one file in fixed-size chunks.
    ///
    /// On failure the partially written destination stays in place and the
    /// error carries the number of bytes flushed to it.
    pub async fn transfer(
        &self,
        lease: &Lease,
        direction: TransferDirection,
        local_path: impl AsRef<Path>,
        remote_path: &str,
        progress: Option<mpsc::Sender<TransferProgress>>,
    ) -> TransferJob {
        let mut job = TransferJob {
            direction,
            local_path: local_path.as_ref().to_path_buf(),
            remote_path: remote_path.to_string(),
            bytes_transferred: 0,
            total_bytes: None,
            status: TransferStatus::Running,
        };

        let result = match direction {
            TransferDirection::Upload => self.upload(lease, &mut job, progress).await,
            TransferDirection::Download => self.download(lease, &mut job, progress).await,
        };

        job.status = match result {
            Ok(()) => {
                info!(
                    "[transfer] {:?} {} <-> {} complete ({} bytes)",
                    direction,
                    job.local_path.display(),
                    job.remote_path,
                    job.bytes_transferred
                );
                TransferStatus::Completed
            }
            Err(err) => {
                warn!("[transfer] {:?} {} failed: {}", direction, job.remote_path, err);
                TransferStatus::Failed(err)
            }
        };
        job
    }

    async fn upload(
        &self,
        lease: &Lease,
        job: &mut TransferJob,
        progress: Option<mpsc::Sender<TransferProgress>>,
    ) -> Result<(), TransferError> {
        validate_paths(&job.local_path, &job.remote_path)?;
        let local = job.local_path.display().to_string();

        let mut source = File::open(&job.local_path)
            .await
            .map_err(|e| local_io(&local, &e, 0))?;
        job.total_bytes = source.metadata().await.ok().map(|m| m.len());

        let guard = lease.begin_operation().await;
        let mut dest = guard
            .transport()
            .open_write(&job.remote_path)
            .await
            .map_err(|e| TransferError::from_open(&job.remote_path, e))?;

        debug!("[transfer] upload {} -> {}", local, job.remote_path);
        match self.copy(&mut source, &mut dest, job, progress).await {
            Ok(()) => Ok(()),
            Err(CopyFailure::Source(e)) => Err(local_io(&local, &e, job.bytes_transferred)),
            Err(CopyFailure::Destination(e)) => Err(TransferError::Interrupted {
                message: e.to_string(),
                bytes: job.bytes_transferred,
            }),
        }
    }

    async fn download(
        &self,
        lease: &Lease,
        job: &mut TransferJob,
        progress: Option<mpsc::Sender<TransferProgress>>,
    ) -> Result<(), TransferError> {
        validate_paths(&job.local_path, &job.remote_path)?;
        let local = job.local_path.display().to_string();

        let guard = lease.begin_operation().await;
        let mut source = guard
            .transport()
            .open_read(&job.remote_path)
            .await
            .map_err(|e| TransferError::from_open(&job.remote_path, e))?;

        let mut dest = File::create(&job.local_path)
            .await
            .map_err(|e| local_io(&local, &e, 0))?;

        debug!("[transfer] download {} -> {}", job.remote_path, local);
        match self.copy(&mut source, &mut dest, job, progress).await {
            Ok(()) => Ok(()),
            Err(CopyFailure::Source(e)) => Err(TransferError::Interrupted {
                message: e.to_string(),
                bytes: job.bytes_transferred,
            }),
            Err(CopyFailure::Destination(e)) => Err(local_io(&local, &e, job.bytes_transferred)),
        }
    }

    /// Copy chunk by chunk. A chunk counts towards `job.bytes_transferred`
    /// once the destination has flushed it.
    async fn copy<R, W>(
        &self,
        source: &mut R,
        dest: &mut W,
        job: &mut TransferJob,
        progress: Option<mpsc::Sender<TransferProgress>>,
    ) -> Result<(), CopyFailure>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; self.chunk_size];

        loop {
            let n = source.read(&mut buf).await.map_err(CopyFailure::Source)?;
            if n == 0 {
                break;
            }

            let mut offset = 0;
            while offset < n {
                let written = dest
                    .write(&buf[offset..n])
                    .await
                    .map_err(CopyFailure::Destination)?;
                if written == 0 {
                    return Err(CopyFailure::Destination(std::io::ErrorKind::WriteZero.into()));
                }
                offset += written;
            }
            dest.flush().await.map_err(CopyFailure::Destination)?;
            job.bytes_transferred += n as u64;

            if let Some(tx) = &progress {
                // Progress is advisory; a slow listener just misses updates
                let _ = tx.try_send(TransferProgress {
                    bytes_transferred: job.bytes_transferred,
                    total_bytes: job.total_bytes,
                });
            }
        }

        dest.shutdown().await.map_err(CopyFailure::Destination)?;
        Ok(())
    }
}

fn validate_paths(local: &Path, remote: &str) -> Result<(), TransferError> {
    if local.as_os_str().is_empty() {
        return Err(TransferError::InvalidPath("local_path is empty".into()));
    }
    if remote.trim().is_empty() || remote.contains('\0') {
        return Err(TransferError::InvalidPath(format!("remote_path {:?}", remote)));
    }
    Ok(())
}

fn local_io(path: &str, err: &std::io::Error, bytes: u64) -> TransferError {
    TransferError::LocalIo {
        path: path.to_string(),
        message: err.to_string(),
        bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionRegistry, LeaseMode, RegistryConfig};
    use crate::testing::{password_key, MockConnector};
    use std::sync::Arc;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn lease(connector: &Arc<MockConnector>) -> Lease {
        let registry = ConnectionRegistry::new(connector.clone(), RegistryConfig::default());
        registry.lease(&password_key("files"), LeaseMode::Shared).await.unwrap()
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let connector = Arc::new(MockConnector::new());
        let lease = lease(&connector).await;
        let dir = tempfile::tempdir().unwrap();
        let data = payload(100_000);

        let src = dir.path().join("src.bin");
        std::fs::write(&src, &data).unwrap();

        let pipeline = TransferPipeline::new(4096);
        let (tx, mut rx) = mpsc::channel(64);
        let job = pipeline
            .transfer(&lease, TransferDirection::Upload, &src, "/tmp/remote.bin", Some(tx))
            .await;

        assert!(job.is_success(), "{:?}", job.error());
        assert_eq!(job.bytes_transferred, 100_000);
        assert_eq!(job.total_bytes, Some(100_000));
        assert_eq!(connector.file("/tmp/remote.bin").unwrap(), data);

        let mut last = 0;
        while let Ok(p) = rx.try_recv() {
            assert!(p.bytes_transferred > last);
            last = p.bytes_transferred;
        }
        assert_eq!(last, 100_000);

        let dst = dir.path().join("back.bin");
        let job = pipeline
            .transfer(&lease, TransferDirection::Download, &dst, "/tmp/remote.bin", None)
            .await;
        assert!(job.is_success());
        assert_eq!(std::fs::read(&dst).unwrap(), data);
    }

    #[tokio::test]
    async fn test_interrupted_download_leaves_partial_file() {
        let connector = Arc::new(MockConnector::new());
        connector.put_file("/var/log/big.log", &payload(10_000));
        connector.fail_transfers_after(5_000);
        let lease = lease(&connector).await;
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("big.log");

        let job = TransferPipeline::new(4096)
            .transfer(&lease, TransferDirection::Download, &dst, "/var/log/big.log", None)
            .await;

        let err = job.error().unwrap();
        assert!(matches!(err, TransferError::Interrupted { .. }));
        assert_eq!(err.bytes_written(), 5_000);
        assert_eq!(std::fs::metadata(&dst).unwrap().len(), 5_000);
    }

    #[tokio::test]
    async fn test_interrupted_upload_reports_flushed_bytes() {
        let connector = Arc::new(MockConnector::new());
        connector.fail_transfers_after(6_000);
        let lease = lease(&connector).await;
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("upload.bin");
        std::fs::write(&src, payload(20_000)).unwrap();

        let job = TransferPipeline::new(4096)
            .transfer(&lease, TransferDirection::Upload, &src, "/srv/upload.bin", None)
            .await;

        // The second chunk never got flushed
        let err = job.error().unwrap();
        assert_eq!(err.kind(), "transport");
        assert_eq!(err.bytes_written(), 4096);
        assert_eq!(job.bytes_transferred, 4096);
        assert_eq!(connector.file("/srv/upload.bin").unwrap().len(), 4096);
    }

    /// Accepts every write; flushes succeed `flushes` times, then fail
    struct FlakyFlush {
        flushes: usize,
    }

    impl AsyncWrite for FlakyFlush {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            if self.flushes == 0 {
                return std::task::Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()));
            }
            self.flushes -= 1;
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_failed_flush_is_not_counted() {
        let data = payload(10_000);
        let mut source: &[u8] = &data;
        let mut dest = FlakyFlush { flushes: 1 };
        let mut job = TransferJob {
            direction: TransferDirection::Upload,
            local_path: PathBuf::from("/tmp/local.bin"),
            remote_path: "/tmp/remote.bin".into(),
            bytes_transferred: 0,
            total_bytes: Some(10_000),
            status: TransferStatus::Running,
        };
        let (tx, mut rx) = mpsc::channel(8);

        let result = TransferPipeline::new(4096)
            .copy(&mut source, &mut dest, &mut job, Some(tx))
            .await;

        assert!(matches!(result, Err(CopyFailure::Destination(_))));
        assert_eq!(job.bytes_transferred, 4096);
        // Progress only for the chunk that made it
        assert_eq!(rx.recv().await.unwrap().bytes_transferred, 4096);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_missing_local_file() {
        let connector = Arc::new(MockConnector::new());
        let lease = lease(&connector).await;
        let dir = tempfile::tempdir().unwrap();

        let job = TransferPipeline::default()
            .transfer(
                &lease,
                TransferDirection::Upload,
                dir.path().join("nope"),
                "/tmp/x",
                None,
            )
            .await;

        assert!(matches!(job.error(), Some(TransferError::LocalIo { bytes: 0, .. })));
    }

    #[tokio::test]
    async fn test_remote_errors() {
        let connector = Arc::new(MockConnector::new());
        let lease = lease(&connector).await;
        let dir = tempfile::tempdir().unwrap();

        let job = TransferPipeline::default()
            .transfer(&lease, TransferDirection::Download, dir.path().join("a"), "/missing", None)
            .await;
        assert_eq!(job.error().unwrap().kind(), "remote_io");

        let src = dir.path().join("b");
        std::fs::write(&src, b"x").unwrap();
        let job = TransferPipeline::default()
            .transfer(&lease, TransferDirection::Upload, &src, "/readonly/b", None)
            .await;
        assert_eq!(job.error().unwrap().kind(), "remote_io");
    }

    #[tokio::test]
    async fn test_unwritable_local_destination() {
        let connector = Arc::new(MockConnector::new());
        connector.put_file("/etc/hosts", b"127.0.0.1 localhost\n");
        let lease = lease(&connector).await;
        let dir = tempfile::tempdir().unwrap();

        let job = TransferPipeline::default()
            .transfer(
                &lease,
                TransferDirection::Download,
                dir.path().join("no/such/dir/hosts"),
                "/etc/hosts",
                None,
            )
            .await;
        assert_eq!(job.error().unwrap().kind(), "local_io");
    }
}
