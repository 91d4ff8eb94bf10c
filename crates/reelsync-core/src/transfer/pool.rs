//! Worker pool that downloads remote files into the staging directory.

use super::retry::{retry_async, RetryPolicy};
use crate::cancel::CancellationToken;
use crate::config::{TransferConfig, TransferSettings};
use crate::error::TransferError;
use crate::models::{relative_to, RemoteEntry};
use crate::naming::sanitize_component;
use crate::remote::{ByteStream, RemoteConnection, RemoteSource};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// A file that finished downloading.
#[derive(Debug, Clone)]
pub struct LocalFile {
    pub entry: RemoteEntry,
    pub local_path: PathBuf,
    pub bytes: u64,
    /// Attempts it took, including the successful one.
    pub attempts: u32,
}

/// Bounded pool of download workers.
///
/// At most `workers` remote operations run at once. Idle connections are kept
/// for reuse; a connection that saw a transient failure is dropped and the
/// next attempt opens a fresh one.
pub struct TransferPool {
    source: Arc<dyn RemoteSource>,
    remote_root: String,
    staging_dir: PathBuf,
    workers: usize,
    policy: RetryPolicy,
    stall_timeout: Duration,
    permits: Semaphore,
    idle: Mutex<Vec<Box<dyn RemoteConnection>>>,
    cancel: CancellationToken,
}

impl TransferPool {
    pub fn new(
        source: Arc<dyn RemoteSource>,
        staging_dir: impl Into<PathBuf>,
        settings: &TransferSettings,
    ) -> Self {
        let workers = settings.workers.max(1);
        Self {
            source,
            remote_root: "/".to_string(),
            staging_dir: staging_dir.into(),
            workers,
            policy: RetryPolicy::from_settings(settings),
            stall_timeout: TransferConfig::STALL_TIMEOUT,
            permits: Semaphore::new(workers),
            idle: Mutex::new(Vec::with_capacity(workers)),
            cancel: CancellationToken::new(),
        }
    }

    /// Remote directory whose layout is mirrored under the staging directory.
    pub fn with_remote_root(mut self, remote_root: impl Into<String>) -> Self {
        self.remote_root = remote_root.into();
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn describe_source(&self) -> String {
        self.source.describe()
    }

    /// Where `entry` is written locally: its path relative to the remote root,
    /// component by component, under the staging directory.
    pub fn staging_path(&self, entry: &RemoteEntry) -> PathBuf {
        let relative = relative_to(&entry.path, &self.remote_root);
        let mut path = self.staging_dir.clone();
        let mut pushed = false;
        for part in relative.split('/').filter(|p| !p.is_empty()) {
            path.push(sanitize_component(part));
            pushed = true;
        }
        if !pushed {
            path.push(sanitize_component(&entry.name));
        }
        path
    }

    /// List `path` on the remote, retrying transient failures.
    pub async fn list(
        &self,
        path: &str,
        recursive: bool,
    ) -> Result<Vec<RemoteEntry>, TransferError> {
        let (result, stats) = retry_async(
            &self.policy,
            Some(&self.cancel),
            |_| self.attempt_list(path, recursive),
            |e: &TransferError| e.is_retryable(),
        )
        .await;

        match &result {
            Ok(entries) => info!(
                "Listed {} entries under {} ({} attempt(s))",
                entries.len(),
                path,
                stats.attempts
            ),
            Err(e) => warn!("Listing {} failed after {} attempt(s): {}", path, stats.attempts, e),
        }
        result
    }

    /// Download `entry` into the staging directory.
    ///
    /// Transient failures are retried per the pool's policy, each retry on a
    /// fresh connection. Permanent failures return immediately.
    pub async fn download(&self, entry: &RemoteEntry) -> Result<LocalFile, TransferError> {
        let local_path = self.staging_path(entry);

        let (result, stats) = retry_async(
            &self.policy,
            Some(&self.cancel),
            |attempt| self.attempt_download(entry, &local_path, attempt),
            |e: &TransferError| e.is_retryable(),
        )
        .await;

        let bytes = result?;
        debug!(
            "Downloaded {} -> {} ({} bytes, {} attempt(s))",
            entry.path,
            local_path.display(),
            bytes,
            stats.attempts
        );

        Ok(LocalFile {
            entry: entry.clone(),
            local_path,
            bytes,
            attempts: stats.attempts,
        })
    }

    async fn attempt_list(
        &self,
        path: &str,
        recursive: bool,
    ) -> Result<Vec<RemoteEntry>, TransferError> {
        let _permit = self.acquire(path).await?;
        let mut conn = self.checkout().await?;

        match tokio::time::timeout(TransferConfig::LIST_TIMEOUT, conn.list(path, recursive)).await {
            Ok(Ok(entries)) => {
                self.checkin(conn);
                Ok(entries)
            }
            Ok(Err(e)) => {
                self.release(conn, &e);
                Err(e)
            }
            Err(_) => Err(TransferError::transient(path, "listing timed out")),
        }
    }

    async fn attempt_download(
        &self,
        entry: &RemoteEntry,
        local_path: &Path,
        attempt: u32,
    ) -> Result<u64, TransferError> {
        let _permit = self.acquire(&entry.path).await?;
        if attempt > 0 {
            debug!("Attempt {} for {}", attempt + 1, entry.path);
        }

        let mut conn = self.checkout().await?;
        let stream = match conn.fetch(&entry.path).await {
            Ok(stream) => stream,
            Err(e) => {
                self.release(conn, &e);
                return Err(e);
            }
        };

        match write_part_file(stream, &entry.path, local_path, self.stall_timeout).await {
            Ok(bytes) => {
                self.checkin(conn);
                Ok(bytes)
            }
            Err(e) => {
                self.release(conn, &e);
                Err(e)
            }
        }
    }

    async fn acquire(
        &self,
        path: &str,
    ) -> Result<tokio::sync::SemaphorePermit<'_>, TransferError> {
        self.permits
            .acquire()
            .await
            .map_err(|_| TransferError::transient(path, "transfer pool closed"))
    }

    async fn checkout(&self) -> Result<Box<dyn RemoteConnection>, TransferError> {
        let reused = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        match reused {
            Some(conn) => Ok(conn),
            None => {
                debug!("Opening connection to {}", self.source.describe());
                self.source.connect().await
            }
        }
    }

    fn checkin(&self, conn: Box<dyn RemoteConnection>) {
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < self.workers {
                idle.push(conn);
            }
        }
    }

    /// Return the connection after a failed operation. Only permanent
    /// failures leave it usable.
    fn release(&self, conn: Box<dyn RemoteConnection>, err: &TransferError) {
        if err.is_retryable() {
            debug!("Dropping connection after transient failure: {}", err);
        } else {
            self.checkin(conn);
        }
    }
}

fn part_path_for(local_path: &Path) -> PathBuf {
    let mut part = local_path.as_os_str().to_owned();
    part.push(TransferConfig::DOWNLOAD_TEMP_SUFFIX);
    PathBuf::from(part)
}

fn local_io_error(path: &Path, err: &std::io::Error) -> TransferError {
    TransferError::from_io(path.to_string_lossy(), err)
}

/// Stream into `<local_path>.part` and rename into place once complete. The
/// partial file is removed on any failure.
async fn write_part_file(
    stream: ByteStream,
    remote_path: &str,
    local_path: &Path,
    stall_timeout: Duration,
) -> Result<u64, TransferError> {
    if let Some(parent) = local_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| local_io_error(parent, &e))?;
    }

    let part_path = part_path_for(local_path);
    let file = tokio::fs::File::create(&part_path)
        .await
        .map_err(|e| local_io_error(&part_path, &e))?;

    let result = match copy_stream(stream, file, remote_path, &part_path, stall_timeout).await {
        Ok(bytes) => tokio::fs::rename(&part_path, local_path)
            .await
            .map(|()| bytes)
            .map_err(|e| local_io_error(local_path, &e)),
        Err(e) => Err(e),
    };

    if result.is_err() {
        let _ = tokio::fs::remove_file(&part_path).await;
    }
    result
}

async fn copy_stream(
    mut stream: ByteStream,
    mut file: tokio::fs::File,
    remote_path: &str,
    part_path: &Path,
    stall_timeout: Duration,
) -> Result<u64, TransferError> {
    let mut written: u64 = 0;
    loop {
        let next = tokio::time::timeout(stall_timeout, stream.next())
            .await
            .map_err(|_| TransferError::transient(remote_path, "transfer stalled"))?;
        let Some(chunk) = next else {
            break;
        };
        let chunk = chunk?;
        file.write_all(&chunk)
            .await
            .map_err(|e| local_io_error(part_path, &e))?;
        written += chunk.len() as u64;
    }

    file.flush()
        .await
        .map_err(|e| local_io_error(part_path, &e))?;
    file.sync_all()
        .await
        .map_err(|e| local_io_error(part_path, &e))?;
    Ok(written)
}
