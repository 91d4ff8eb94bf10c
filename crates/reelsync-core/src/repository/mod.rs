//! Lifecycle repository: one persisted row per remote identity.
//!
//! Backends are synchronous to match rusqlite. Async callers invoke them
//! directly; every operation is a short indexed statement.

mod memory;
mod sqlite;

pub use memory::MemoryRepository;
pub use sqlite::SqliteRepository;

use crate::error::Result;
use crate::models::{FileStatus, TrackedFile};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Column to sort listings by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    FetchedAt,
    Name,
    Size,
    ModifiedTime,
    Status,
}

impl SortField {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            SortField::FetchedAt => "fetched_at",
            SortField::Name => "name",
            SortField::Size => "size",
            SortField::ModifiedTime => "modified_time",
            SortField::Status => "status",
        }
    }
}

/// Paginated, sortable, searchable listing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileQuery {
    pub status: Option<FileStatus>,
    /// Case-insensitive substring of name, remote identity or show name.
    pub search: Option<String>,
    pub sort_by: SortField,
    pub descending: bool,
    pub limit: usize,
    pub offset: usize,
}

impl Default for FileQuery {
    fn default() -> Self {
        Self {
            status: None,
            search: None,
            sort_by: SortField::FetchedAt,
            descending: true,
            limit: Self::DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

impl FileQuery {
    pub const DEFAULT_LIMIT: usize = 50;

    pub fn with_status(mut self, status: FileStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    pub fn sorted_by(mut self, field: SortField, descending: bool) -> Self {
        self.sort_by = field;
        self.descending = descending;
        self
    }

    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    pub(crate) fn search_term(&self) -> Option<String> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase)
    }
}

/// One page of results plus the unpaginated total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_count: usize,
    pub limit: usize,
    pub offset: usize,
}

/// Row counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub fetched: usize,
    pub processing: usize,
    pub routed: usize,
    pub error: usize,
    pub deleted: usize,
}

impl StatusCounts {
    pub(crate) fn add(&mut self, status: FileStatus, n: usize) {
        match status {
            FileStatus::Fetched => self.fetched += n,
            FileStatus::Processing => self.processing += n,
            FileStatus::Routed => self.routed += n,
            FileStatus::Error => self.error += n,
            FileStatus::Deleted => self.deleted += n,
        }
    }

    pub fn total(&self) -> usize {
        self.fetched + self.processing + self.routed + self.error + self.deleted
    }
}

/// Persisted lifecycle state for tracked files.
pub trait LifecycleRepository: Send + Sync {
    /// Insert or replace the row for `record.remote_identity`.
    ///
    /// Every field is last-write-wins except `provided_token`: a stored token
    /// is kept when the incoming one is null.
    fn upsert_by_remote_identity(&self, record: &TrackedFile) -> Result<()>;

    /// Atomically shift `current_path` into `previous_path`, store `new_path`
    /// and `new_status`, bump `routing_attempts` and stamp the attempt time.
    fn transition_location(
        &self,
        remote_identity: &str,
        new_path: &str,
        new_status: FileStatus,
    ) -> Result<TrackedFile>;

    /// Set status `error` with `message`. Paths are left alone.
    fn mark_error(&self, remote_identity: &str, message: &str) -> Result<()>;

    /// Claim a `fetched` row for routing. False if it was not `fetched`.
    fn begin_processing(&self, remote_identity: &str) -> Result<bool>;

    /// Store the registry id the file was matched to.
    fn record_show_match(&self, remote_identity: &str, external_show_id: &str) -> Result<()>;

    /// Move an `error` row back to `fetched` and clear its message.
    fn reset_for_retry(&self, remote_identity: &str) -> Result<bool>;

    /// Terminal bookkeeping status. Never touches the filesystem.
    fn mark_deleted(&self, remote_identity: &str) -> Result<bool>;

    fn get(&self, remote_identity: &str) -> Result<Option<TrackedFile>>;

    /// Rows with `status`, oldest fetch first.
    fn list_by_status(&self, status: FileStatus) -> Result<Vec<TrackedFile>>;

    fn list(&self, query: &FileQuery) -> Result<Page<TrackedFile>>;

    fn known_identities(&self) -> Result<HashSet<String>>;

    /// Identities a diff should treat as already handled.
    ///
    /// With `retry_failed_downloads`, error rows that never produced a
    /// hashed local file are left out so they are fetched again.
    fn known_identities_for_diff(&self, retry_failed_downloads: bool) -> Result<HashSet<String>>;

    fn status_counts(&self) -> Result<StatusCounts>;
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behavior every backend must share.

    use super::*;
    use crate::error::SyncError;
    use crate::models::RemoteEntry;
    use chrono::{TimeZone, Utc};

    pub fn record(path: &str, token: Option<&str>) -> TrackedFile {
        let entry = RemoteEntry::file(path, 1_000, Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        let mut record = TrackedFile::from_entry(&entry)
            .with_local_path(std::path::Path::new(&format!("/staging{}", path)))
            .with_provided_token(token.map(str::to_string));
        record.hash_value = Some("0D4A1185".to_string());
        record
    }

    pub fn provided_token_survives_null_upsert(repo: &dyn LifecycleRepository) {
        repo.upsert_by_remote_identity(&record("/r/a.mkv", Some("A4DD1E71")))
            .unwrap();
        let mut second = record("/r/a.mkv", None);
        second.size = 2_000;
        repo.upsert_by_remote_identity(&second).unwrap();

        let stored = repo.get("/r/a.mkv").unwrap().unwrap();
        assert_eq!(stored.provided_token.as_deref(), Some("A4DD1E71"));
        assert_eq!(stored.size, 2_000);

        repo.upsert_by_remote_identity(&record("/r/a.mkv", Some("11111111")))
            .unwrap();
        let stored = repo.get("/r/a.mkv").unwrap().unwrap();
        assert_eq!(stored.provided_token.as_deref(), Some("11111111"));
    }

    pub fn transitions_keep_two_deep_chain(repo: &dyn LifecycleRepository) {
        let mut rec = record("/r/b.mkv", None);
        rec.current_path = Some("A".to_string());
        repo.upsert_by_remote_identity(&rec).unwrap();

        let first = repo
            .transition_location("/r/b.mkv", "B", FileStatus::Processing)
            .unwrap();
        assert_eq!(first.previous_path.as_deref(), Some("A"));
        assert_eq!(first.current_path.as_deref(), Some("B"));

        let second = repo
            .transition_location("/r/b.mkv", "C", FileStatus::Routed)
            .unwrap();
        assert_eq!(second.previous_path.as_deref(), Some("B"));
        assert_eq!(second.current_path.as_deref(), Some("C"));
        assert_eq!(second.status, FileStatus::Routed);
        assert_eq!(second.routing_attempts, 2);
        assert!(second.last_routing_attempt.is_some());

        let stored = repo.get("/r/b.mkv").unwrap().unwrap();
        assert_eq!(stored, second);
    }

    pub fn transition_rejects_backwards_status(repo: &dyn LifecycleRepository) {
        let mut rec = record("/r/c.mkv", None);
        rec.status = FileStatus::Routed;
        repo.upsert_by_remote_identity(&rec).unwrap();

        let err = repo
            .transition_location("/r/c.mkv", "X", FileStatus::Fetched)
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidTransition { .. }));
        let stored = repo.get("/r/c.mkv").unwrap().unwrap();
        assert_eq!(stored.current_path, rec.current_path);

        assert!(matches!(
            repo.transition_location("/r/missing.mkv", "X", FileStatus::Routed),
            Err(SyncError::NotFound { .. })
        ));
    }

    pub fn mark_error_leaves_paths(repo: &dyn LifecycleRepository) {
        let rec = record("/r/d.mkv", None);
        repo.upsert_by_remote_identity(&rec).unwrap();
        repo.mark_error("/r/d.mkv", "destination exists").unwrap();

        let stored = repo.get("/r/d.mkv").unwrap().unwrap();
        assert_eq!(stored.status, FileStatus::Error);
        assert_eq!(stored.error_message.as_deref(), Some("destination exists"));
        assert_eq!(stored.current_path, rec.current_path);
        assert_eq!(stored.previous_path, None);

        assert!(repo.reset_for_retry("/r/d.mkv").unwrap());
        let stored = repo.get("/r/d.mkv").unwrap().unwrap();
        assert_eq!(stored.status, FileStatus::Fetched);
        assert_eq!(stored.error_message, None);
        assert!(!repo.reset_for_retry("/r/d.mkv").unwrap());

        assert!(matches!(
            repo.mark_error("/r/missing.mkv", "x"),
            Err(SyncError::NotFound { .. })
        ));
    }

    pub fn processing_claim_and_deleted_bookkeeping(repo: &dyn LifecycleRepository) {
        repo.upsert_by_remote_identity(&record("/r/e.mkv", None))
            .unwrap();
        assert!(repo.begin_processing("/r/e.mkv").unwrap());
        assert!(!repo.begin_processing("/r/e.mkv").unwrap());
        assert_eq!(
            repo.get("/r/e.mkv").unwrap().unwrap().status,
            FileStatus::Processing
        );

        repo.record_show_match("/r/e.mkv", "show-42").unwrap();
        assert_eq!(
            repo.get("/r/e.mkv").unwrap().unwrap().external_show_id.as_deref(),
            Some("show-42")
        );

        assert!(repo.mark_deleted("/r/e.mkv").unwrap());
        assert!(!repo.mark_deleted("/r/e.mkv").unwrap());
        assert!(repo.mark_error("/r/e.mkv", "late").is_err());
        assert!(repo.get("/r/e.mkv").unwrap().is_some());
    }

    pub fn listing_and_counts(repo: &dyn LifecycleRepository) {
        let names = ["Alpha - 01.mkv", "Beta - 02.mkv", "Gamma - 03.mkv", "alphabet.mkv"];
        for (i, name) in names.iter().enumerate() {
            let mut rec = record(&format!("/r/{}", name), None);
            rec.size = (i as u64 + 1) * 100;
            rec.fetched_at = Utc.with_ymd_and_hms(2024, 6, 1, 0, i as u32, 0).unwrap();
            repo.upsert_by_remote_identity(&rec).unwrap();
        }
        repo.mark_error("/r/Gamma - 03.mkv", "boom").unwrap();

        let page = repo
            .list(&FileQuery::default().with_search("ALPHA").sorted_by(SortField::Size, false))
            .unwrap();
        assert_eq!(page.total_count, 2);
        assert_eq!(page.items[0].name, "Alpha - 01.mkv");
        assert_eq!(page.items[1].name, "alphabet.mkv");

        let page = repo
            .list(&FileQuery::default().sorted_by(SortField::FetchedAt, true).page(2, 1))
            .unwrap();
        assert_eq!(page.total_count, 4);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].name, "Gamma - 03.mkv");
        assert_eq!(page.items[1].name, "Beta - 02.mkv");

        let errors = repo
            .list(&FileQuery::default().with_status(FileStatus::Error))
            .unwrap();
        assert_eq!(errors.total_count, 1);

        let fetched = repo.list_by_status(FileStatus::Fetched).unwrap();
        let order: Vec<_> = fetched.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(order, vec!["Alpha - 01.mkv", "Beta - 02.mkv", "alphabet.mkv"]);

        let counts = repo.status_counts().unwrap();
        assert_eq!(counts.fetched, 3);
        assert_eq!(counts.error, 1);
        assert_eq!(counts.total(), 4);
    }

    pub fn known_identities_skip_failed_downloads(repo: &dyn LifecycleRepository) {
        repo.upsert_by_remote_identity(&record("/r/ok.mkv", None))
            .unwrap();
        let entry = RemoteEntry::file("/r/failed.mkv", 1, Utc::now());
        repo.upsert_by_remote_identity(&TrackedFile::failed(&entry, None, "timeout"))
            .unwrap();
        let routed_error = record("/r/route-failed.mkv", None);
        repo.upsert_by_remote_identity(&routed_error).unwrap();
        repo.mark_error("/r/route-failed.mkv", "no show").unwrap();
        let unreadable = RemoteEntry::file("/r/unhashed.mkv", 1, Utc::now());
        repo.upsert_by_remote_identity(&TrackedFile::failed(
            &unreadable,
            Some(std::path::Path::new("/staging/r/unhashed.mkv")),
            "read error",
        ))
        .unwrap();

        let all = repo.known_identities().unwrap();
        assert_eq!(all.len(), 4);

        let for_diff = repo.known_identities_for_diff(true).unwrap();
        assert!(for_diff.contains("/r/ok.mkv"));
        assert!(for_diff.contains("/r/route-failed.mkv"));
        assert!(!for_diff.contains("/r/failed.mkv"));
        assert!(!for_diff.contains("/r/unhashed.mkv"));

        assert_eq!(repo.known_identities_for_diff(false).unwrap(), all);
    }

    pub fn run_all(make: impl Fn() -> Box<dyn LifecycleRepository>) {
        provided_token_survives_null_upsert(make().as_ref());
        transitions_keep_two_deep_chain(make().as_ref());
        transition_rejects_backwards_status(make().as_ref());
        mark_error_leaves_paths(make().as_ref());
        processing_claim_and_deleted_bookkeeping(make().as_ref());
        listing_and_counts(make().as_ref());
        known_identities_skip_failed_downloads(make().as_ref());
    }
}
