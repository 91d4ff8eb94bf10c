//! Shared fixtures for the pipeline integration tests.

#![allow(dead_code)]

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reelsync_core::{MemoryRemote, RetryPolicy, SyncConfig};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

pub const REMOTE_ROOT: &str = "/tv";

/// Staging, library and database directories under one temp dir.
pub struct TestEnv {
    pub root: TempDir,
    pub remote: MemoryRemote,
}

impl TestEnv {
    pub fn new() -> Self {
        let root = TempDir::new().expect("Failed to create temp dir");
        std::fs::create_dir_all(root.path().join("library")).unwrap();
        Self {
            root,
            remote: MemoryRemote::new().with_chunk_size(8),
        }
    }

    pub fn staging(&self) -> PathBuf {
        self.root.path().join("staging")
    }

    pub fn library(&self) -> PathBuf {
        self.root.path().join("library")
    }

    pub fn database(&self) -> PathBuf {
        self.root.path().join("reelsync.db")
    }

    pub fn config(&self) -> SyncConfig {
        let mut config = SyncConfig::default();
        config.remote_root = REMOTE_ROOT.to_string();
        config.staging_dir = self.staging();
        config.library_dir = self.library();
        config.database_path = self.database();
        config.transfer.workers = 2;
        config
    }

    /// Put a settled file (older than the minimum age) on the remote.
    pub fn add_remote_file(&self, relative: &str, contents: &str) -> String {
        let path = format!("{}/{}", REMOTE_ROOT, relative);
        self.remote.insert(&path, contents.to_string(), settled());
        path
    }

    pub fn staged(&self, relative: &str) -> PathBuf {
        self.staging().join(relative)
    }
}

pub fn settled() -> DateTime<Utc> {
    Utc::now() - ChronoDuration::hours(2)
}

/// Retries with millisecond backoff so tests stay fast.
pub fn fast_policy(attempts: u32) -> RetryPolicy {
    RetryPolicy::new()
        .with_max_attempts(attempts)
        .with_base_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(5))
        .with_jitter(false)
}

/// Every regular file below `dir`, relative to it.
pub fn files_under(dir: &Path) -> Vec<String> {
    let mut files: Vec<String> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            e.path()
                .strip_prefix(dir)
                .ok()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
        })
        .collect();
    files.sort();
    files
}
