//! Remote backed by a directory on a local or mounted filesystem.

use super::{ByteStream, RemoteConnection, RemoteSource};
use crate::error::TransferError;
use crate::models::RemoteEntry;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncReadExt;
use walkdir::WalkDir;

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Serves the tree under `root`. Remote path `/a/b.mkv` maps to `root/a/b.mkv`.
#[derive(Debug, Clone)]
pub struct LocalDirSource {
    root: PathBuf,
}

impl LocalDirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a remote path onto the filesystem, refusing anything that would
    /// leave the root.
    fn resolve(&self, remote_path: &str) -> Result<PathBuf, TransferError> {
        let mut resolved = self.root.clone();
        for component in Path::new(remote_path.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(TransferError::permanent(
                        remote_path,
                        "path escapes the source root",
                    ))
                }
            }
        }
        Ok(resolved)
    }
}

#[async_trait]
impl RemoteSource for LocalDirSource {
    fn describe(&self) -> String {
        format!("local directory {}", self.root.display())
    }

    async fn connect(&self) -> Result<Box<dyn RemoteConnection>, TransferError> {
        let root = self.root.to_string_lossy().into_owned();
        match tokio::fs::metadata(&self.root).await {
            Ok(metadata) if metadata.is_dir() => Ok(Box::new(LocalConnection {
                source: self.clone(),
            })),
            Ok(_) => Err(TransferError::permanent(root, "source root is not a directory")),
            Err(e) => Err(TransferError::from_io(root, &e)),
        }
    }
}

struct LocalConnection {
    source: LocalDirSource,
}

#[async_trait]
impl RemoteConnection for LocalConnection {
    async fn list(&mut self, path: &str, recursive: bool) -> Result<Vec<RemoteEntry>, TransferError> {
        let dir = self.source.resolve(path)?;
        let root = self.source.root.clone();
        let remote_path = path.to_string();

        tokio::task::spawn_blocking(move || walk(&root, &dir, &remote_path, recursive))
            .await
            .map_err(|e| TransferError::transient(path, format!("listing task failed: {}", e)))?
    }

    async fn fetch(&mut self, path: &str) -> Result<ByteStream, TransferError> {
        let file_path = self.source.resolve(path)?;
        let file = tokio::fs::File::open(&file_path)
            .await
            .map_err(|e| TransferError::from_io(path, &e))?;
        let metadata = file
            .metadata()
            .await
            .map_err(|e| TransferError::from_io(path, &e))?;
        if metadata.is_dir() {
            return Err(TransferError::permanent(path, "cannot fetch a directory"));
        }

        let stream = futures::stream::try_unfold(
            (file, path.to_string()),
            |(mut file, path)| async move {
                let mut buf = vec![0u8; READ_CHUNK_SIZE];
                let n = match file.read(&mut buf).await {
                    Ok(n) => n,
                    Err(e) => return Err(TransferError::from_io(path.as_str(), &e)),
                };
                if n == 0 {
                    return Ok(None);
                }
                buf.truncate(n);
                Ok(Some((Bytes::from(buf), (file, path))))
            },
        );
        Ok(stream.boxed())
    }
}

fn walk(
    root: &Path,
    dir: &Path,
    remote_path: &str,
    recursive: bool,
) -> Result<Vec<RemoteEntry>, TransferError> {
    let metadata = std::fs::metadata(dir).map_err(|e| TransferError::from_io(remote_path, &e))?;
    if !metadata.is_dir() {
        return Err(TransferError::permanent(remote_path, "not a directory"));
    }

    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut entries = Vec::new();

    for item in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(max_depth)
        .sort_by_file_name()
    {
        let item = item.map_err(|e| walk_error(remote_path, e))?;
        let metadata = item.metadata().map_err(|e| walk_error(remote_path, e))?;
        let relative = item.path().strip_prefix(root).map_err(|_| {
            TransferError::permanent(remote_path, "listed entry is outside the source root")
        })?;

        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let size = if metadata.is_dir() { 0 } else { metadata.len() };

        entries.push(RemoteEntry::new(
            to_remote_path(relative),
            size,
            modified,
            metadata.is_dir(),
        ));
    }

    Ok(entries)
}

fn walk_error(remote_path: &str, err: walkdir::Error) -> TransferError {
    match err.io_error() {
        Some(io) => TransferError::from_io(remote_path, io),
        None => TransferError::permanent(remote_path, err.to_string()),
    }
}

fn to_remote_path(relative: &Path) -> String {
    let mut out = String::new();
    for component in relative.components() {
        if let Component::Normal(part) = component {
            out.push('/');
            out.push_str(&part.to_string_lossy());
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use tempfile::TempDir;

    fn fixture() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("Show/Season 1")).unwrap();
        std::fs::write(dir.path().join("Show/Season 1/ep01.mkv"), b"episode one").unwrap();
        std::fs::write(dir.path().join("Show/ep00.mkv"), b"pilot").unwrap();
        std::fs::write(dir.path().join("top.mkv"), b"top").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_list_recursive() {
        let dir = fixture();
        let source = LocalDirSource::new(dir.path());
        let mut conn = source.connect().await.unwrap();

        let entries = conn.list("/", true).await.unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "/Show",
                "/Show/Season 1",
                "/Show/Season 1/ep01.mkv",
                "/Show/ep00.mkv",
                "/top.mkv"
            ]
        );

        let ep = entries.iter().find(|e| e.name == "ep01.mkv").unwrap();
        assert_eq!(ep.size, 11);
        assert!(!ep.is_dir);
        assert!(entries[0].is_dir);
    }

    #[tokio::test]
    async fn test_list_non_recursive_subdir() {
        let dir = fixture();
        let source = LocalDirSource::new(dir.path());
        let mut conn = source.connect().await.unwrap();

        let entries = conn.list("/Show", false).await.unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["/Show/Season 1", "/Show/ep00.mkv"]);
    }

    #[tokio::test]
    async fn test_fetch_streams_contents() {
        let dir = fixture();
        let source = LocalDirSource::new(dir.path());
        let mut conn = source.connect().await.unwrap();

        let chunks: Vec<Bytes> = conn
            .fetch("/Show/Season 1/ep01.mkv")
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(chunks.concat(), b"episode one");
    }

    #[tokio::test]
    async fn test_missing_and_escaping_paths_are_permanent() {
        let dir = fixture();
        let source = LocalDirSource::new(dir.path());
        let mut conn = source.connect().await.unwrap();

        let missing = conn.fetch("/nope.mkv").await.err().unwrap();
        assert!(!missing.is_retryable());

        let escaping = conn.fetch("/../secret").await.err().unwrap();
        assert!(!escaping.is_retryable());

        let dir_fetch = conn.fetch("/Show").await.err().unwrap();
        assert!(!dir_fetch.is_retryable());
    }

    #[tokio::test]
    async fn test_connect_to_missing_root_fails() {
        let dir = TempDir::new().unwrap();
        let source = LocalDirSource::new(dir.path().join("absent"));
        assert!(source.connect().await.is_err());
    }
}
