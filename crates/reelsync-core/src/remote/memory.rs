//! In-memory remote with fault injection.

use super::{ByteStream, RemoteConnection, RemoteSource};
use crate::error::TransferError;
use crate::models::{normalize_remote_path, relative_to, RemoteEntry};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy)]
enum Fault {
    /// Fail the next `n` fetches with a transient error.
    Transient(u32),
    /// Deliver the first chunk of the next `n` fetches, then break the stream.
    MidStream(u32),
    /// Every fetch fails permanently.
    Permanent,
}

#[derive(Debug, Clone)]
struct StoredFile {
    data: Bytes,
    modified_time: DateTime<Utc>,
}

/// Pauses the body of one fetch until released.
#[derive(Debug, Default)]
pub struct FetchHold {
    started: Notify,
    release: Notify,
}

impl FetchHold {
    /// Resolves once the held body has started streaming.
    pub async fn started(&self) {
        self.started.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[derive(Debug, Default)]
struct Shared {
    files: Mutex<BTreeMap<String, StoredFile>>,
    faults: Mutex<HashMap<String, Fault>>,
    holds: Mutex<HashMap<String, Arc<FetchHold>>>,
    fetch_counts: Mutex<HashMap<String, usize>>,
    connects: AtomicUsize,
    unavailable: AtomicBool,
}

/// A remote whose files live in memory.
///
/// Cloning shares the same files, faults and counters, so a test can keep a
/// handle while the pipeline owns another.
#[derive(Debug, Clone)]
pub struct MemoryRemote {
    shared: Arc<Shared>,
    chunk_size: usize,
}

impl MemoryRemote {
    const DEFAULT_CHUNK_SIZE: usize = 4096;

    pub fn new() -> Self {
        Self {
            shared: Arc::default(),
            chunk_size: Self::DEFAULT_CHUNK_SIZE,
        }
    }

    /// Use smaller chunks so streams yield more than once.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn insert(&self, path: &str, data: impl Into<Bytes>, modified_time: DateTime<Utc>) {
        if let Ok(mut files) = self.shared.files.lock() {
            files.insert(
                normalize_remote_path(path),
                StoredFile {
                    data: data.into(),
                    modified_time,
                },
            );
        }
    }

    pub fn remove(&self, path: &str) {
        if let Ok(mut files) = self.shared.files.lock() {
            files.remove(&normalize_remote_path(path));
        }
    }

    pub fn fail_transiently(&self, path: &str, times: u32) {
        self.set_fault(path, Fault::Transient(times));
    }

    pub fn fail_mid_stream(&self, path: &str, times: u32) {
        self.set_fault(path, Fault::MidStream(times));
    }

    pub fn fail_permanently(&self, path: &str) {
        self.set_fault(path, Fault::Permanent);
    }

    /// Hold the body of the next fetch of `path` before its first chunk.
    pub fn hold_fetch(&self, path: &str) -> Arc<FetchHold> {
        let hold = Arc::new(FetchHold::default());
        if let Ok(mut holds) = self.shared.holds.lock() {
            holds.insert(normalize_remote_path(path), Arc::clone(&hold));
        }
        hold
    }

    /// Make `connect()` fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self, path: &str) -> usize {
        self.shared
            .fetch_counts
            .lock()
            .map(|counts| counts.get(&normalize_remote_path(path)).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn set_fault(&self, path: &str, fault: Fault) {
        if let Ok(mut faults) = self.shared.faults.lock() {
            faults.insert(normalize_remote_path(path), fault);
        }
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_error(path: &str) -> TransferError {
    TransferError::transient(path, "remote state lock poisoned")
}

#[async_trait]
impl RemoteSource for MemoryRemote {
    fn describe(&self) -> String {
        "in-memory remote".to_string()
    }

    async fn connect(&self) -> Result<Box<dyn RemoteConnection>, TransferError> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        if self.shared.unavailable.load(Ordering::SeqCst) {
            return Err(TransferError::transient("/", "connection refused"));
        }
        Ok(Box::new(MemoryConnection {
            shared: Arc::clone(&self.shared),
            chunk_size: self.chunk_size.max(1),
        }))
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
    chunk_size: usize,
}

impl MemoryConnection {
    /// Consume one unit of the fault registered for `path`, if any.
    fn take_fault(&self, path: &str) -> Result<Option<Fault>, TransferError> {
        let mut faults = self.shared.faults.lock().map_err(|_| lock_error(path))?;
        let fault = match faults.get(path).copied() {
            None => None,
            Some(Fault::Permanent) => Some(Fault::Permanent),
            Some(Fault::Transient(0)) | Some(Fault::MidStream(0)) => {
                faults.remove(path);
                None
            }
            Some(Fault::Transient(n)) => {
                faults.insert(path.to_string(), Fault::Transient(n - 1));
                Some(Fault::Transient(n))
            }
            Some(Fault::MidStream(n)) => {
                faults.insert(path.to_string(), Fault::MidStream(n - 1));
                Some(Fault::MidStream(n))
            }
        };
        Ok(fault)
    }
}

#[async_trait]
impl RemoteConnection for MemoryConnection {
    async fn list(&mut self, path: &str, recursive: bool) -> Result<Vec<RemoteEntry>, TransferError> {
        let root = normalize_remote_path(path);
        let files = self.shared.files.lock().map_err(|_| lock_error(path))?;

        let mut dirs: BTreeSet<String> = BTreeSet::new();
        let mut entries = Vec::new();

        for (file_path, stored) in files.iter() {
            if !is_under(file_path, &root) {
                continue;
            }
            let relative = relative_to(file_path, &root);

            let parts: Vec<&str> = relative.split('/').collect();
            if !recursive && parts.len() > 1 {
                dirs.insert(join_remote(&root, parts[0]));
                continue;
            }

            let mut prefix = root.clone();
            for part in &parts[..parts.len() - 1] {
                prefix = join_remote(&prefix, part);
                dirs.insert(prefix.clone());
            }
            entries.push(RemoteEntry::file(
                file_path.clone(),
                stored.data.len() as u64,
                stored.modified_time,
            ));
        }

        if entries.is_empty() && dirs.is_empty() && root != "/" {
            return Err(TransferError::permanent(path, "no such directory"));
        }

        let now = Utc::now();
        entries.extend(dirs.into_iter().map(|d| RemoteEntry::dir(d, now)));
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn fetch(&mut self, path: &str) -> Result<ByteStream, TransferError> {
        let path = normalize_remote_path(path);
        if let Ok(mut counts) = self.shared.fetch_counts.lock() {
            *counts.entry(path.clone()).or_insert(0) += 1;
        }

        let fault = self.take_fault(&path)?;
        match fault {
            Some(Fault::Permanent) => {
                return Err(TransferError::permanent(path, "no such file"));
            }
            Some(Fault::Transient(_)) => {
                return Err(TransferError::transient(path, "connection reset by peer"));
            }
            _ => {}
        }

        let data = {
            let files = self.shared.files.lock().map_err(|_| lock_error(&path))?;
            files
                .get(&path)
                .map(|f| f.data.clone())
                .ok_or_else(|| TransferError::permanent(path.clone(), "no such file"))?
        };

        let mut chunks: Vec<Result<Bytes, TransferError>> = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + self.chunk_size).min(data.len());
            chunks.push(Ok(data.slice(offset..end)));
            offset = end;
        }

        if matches!(fault, Some(Fault::MidStream(_))) {
            chunks.truncate(1);
            chunks.push(Err(TransferError::transient(path.clone(), "stream interrupted")));
        }

        let hold = self
            .shared
            .holds
            .lock()
            .map_err(|_| lock_error(&path))?
            .remove(&path);
        let body = futures::stream::iter(chunks);
        match hold {
            Some(hold) => Ok(futures::stream::once(async move {
                hold.started.notify_one();
                hold.release.notified().await;
                body
            })
            .flatten()
            .boxed()),
            None => Ok(body.boxed()),
        }
    }
}

fn is_under(path: &str, root: &str) -> bool {
    let root = root.trim_end_matches('/');
    root.is_empty()
        || path
            .strip_prefix(root)
            .is_some_and(|rest| rest.len() > 1 && rest.starts_with('/'))
}

fn join_remote(parent: &str, child: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, child)
    } else {
        format!("{}/{}", parent, child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn remote() -> MemoryRemote {
        let remote = MemoryRemote::new().with_chunk_size(4);
        let t = Utc::now();
        remote.insert("/tv/Show/ep01.mkv", &b"0123456789"[..], t);
        remote.insert("/tv/Show/Extras/bts.mkv", &b"x"[..], t);
        remote.insert("/tv/other.mkv", &b"yy"[..], t);
        remote
    }

    async fn read_all(conn: &mut Box<dyn RemoteConnection>, path: &str) -> Result<Vec<u8>, TransferError> {
        let chunks: Vec<Bytes> = conn.fetch(path).await?.try_collect().await?;
        Ok(chunks.concat())
    }

    #[tokio::test]
    async fn test_list_recursive_includes_directories() {
        let remote = remote();
        let mut conn = remote.connect().await.unwrap();
        let entries = conn.list("/tv", true).await.unwrap();
        let listed: Vec<(&str, bool)> = entries.iter().map(|e| (e.path.as_str(), e.is_dir)).collect();
        assert_eq!(
            listed,
            vec![
                ("/tv/Show", true),
                ("/tv/Show/Extras", true),
                ("/tv/Show/Extras/bts.mkv", false),
                ("/tv/Show/ep01.mkv", false),
                ("/tv/other.mkv", false),
            ]
        );
    }

    #[tokio::test]
    async fn test_list_non_recursive() {
        let remote = remote();
        let mut conn = remote.connect().await.unwrap();
        let entries = conn.list("/tv", false).await.unwrap();
        let listed: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(listed, vec!["/tv/Show", "/tv/other.mkv"]);

        assert!(conn.list("/missing", true).await.is_err());
    }

    #[tokio::test]
    async fn test_fetch_in_chunks() {
        let remote = remote();
        let mut conn = remote.connect().await.unwrap();
        let chunks: Vec<Bytes> = conn
            .fetch("/tv/Show/ep01.mkv")
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), b"0123456789");
        assert_eq!(remote.fetch_count("/tv/Show/ep01.mkv"), 1);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let remote = remote();
        remote.fail_transiently("/tv/other.mkv", 2);
        remote.fail_permanently("/tv/Show/Extras/bts.mkv");
        remote.fail_mid_stream("/tv/Show/ep01.mkv", 1);

        let mut conn = remote.connect().await.unwrap();

        for _ in 0..2 {
            let err = read_all(&mut conn, "/tv/other.mkv").await.unwrap_err();
            assert!(err.is_retryable());
        }
        assert_eq!(read_all(&mut conn, "/tv/other.mkv").await.unwrap(), b"yy");

        let err = read_all(&mut conn, "/tv/Show/Extras/bts.mkv").await.unwrap_err();
        assert!(!err.is_retryable());

        let err = read_all(&mut conn, "/tv/Show/ep01.mkv").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(read_all(&mut conn, "/tv/Show/ep01.mkv").await.unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn test_held_fetch_waits_for_release() {
        let remote = remote();
        let hold = remote.hold_fetch("/tv/other.mkv");
        let mut conn = remote.connect().await.unwrap();

        let reader = tokio::spawn(async move { read_all(&mut conn, "/tv/other.mkv").await });
        hold.started().await;
        assert!(!reader.is_finished());

        hold.release();
        assert_eq!(reader.await.unwrap().unwrap(), b"yy");
    }

    #[tokio::test]
    async fn test_unavailable_and_connect_count() {
        let remote = remote();
        remote.set_unavailable(true);
        assert!(remote.connect().await.is_err());
        remote.set_unavailable(false);
        assert!(remote.connect().await.is_ok());
        assert_eq!(remote.connect_count(), 2);
    }
}
