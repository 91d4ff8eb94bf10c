//! In-memory lifecycle repository.

use super::{FileQuery, LifecycleRepository, Page, SortField, StatusCounts};
use crate::error::{Result, SyncError};
use crate::models::{FileStatus, TrackedFile};
use chrono::Utc;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

/// Repository that lives only as long as the process. Same semantics as the
/// SQLite backend.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    rows: Mutex<BTreeMap<String, TrackedFile>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, TrackedFile>>> {
        self.rows
            .lock()
            .map_err(|_| SyncError::database("Failed to acquire repository lock"))
    }
}

fn not_found(remote_identity: &str) -> SyncError {
    SyncError::NotFound {
        remote_identity: remote_identity.to_string(),
    }
}

fn compare(a: &TrackedFile, b: &TrackedFile, field: SortField) -> Ordering {
    match field {
        SortField::FetchedAt => a.fetched_at.cmp(&b.fetched_at),
        SortField::Name => a.name.cmp(&b.name),
        SortField::Size => a.size.cmp(&b.size),
        SortField::ModifiedTime => a.modified_time.cmp(&b.modified_time),
        SortField::Status => a.status.as_str().cmp(b.status.as_str()),
    }
}

fn matches_search(record: &TrackedFile, term: &str) -> bool {
    record.name.to_lowercase().contains(term)
        || record.remote_identity.to_lowercase().contains(term)
        || record
            .show_name
            .as_deref()
            .is_some_and(|s| s.to_lowercase().contains(term))
}

impl LifecycleRepository for MemoryRepository {
    fn upsert_by_remote_identity(&self, record: &TrackedFile) -> Result<()> {
        let mut rows = self.lock()?;
        let mut incoming = record.clone();
        if incoming.provided_token.is_none() {
            incoming.provided_token = rows
                .get(&record.remote_identity)
                .and_then(|existing| existing.provided_token.clone());
        }
        rows.insert(record.remote_identity.clone(), incoming);
        Ok(())
    }

    fn transition_location(
        &self,
        remote_identity: &str,
        new_path: &str,
        new_status: FileStatus,
    ) -> Result<TrackedFile> {
        let mut rows = self.lock()?;
        let row = rows
            .get_mut(remote_identity)
            .ok_or_else(|| not_found(remote_identity))?;

        if !row.status.can_transition_to(new_status) {
            return Err(SyncError::InvalidTransition {
                remote_identity: remote_identity.to_string(),
                from: row.status.to_string(),
                to: new_status.to_string(),
            });
        }

        row.previous_path = row.current_path.take();
        row.current_path = Some(new_path.to_string());
        row.status = new_status;
        row.routing_attempts += 1;
        row.last_routing_attempt = Some(Utc::now());
        Ok(row.clone())
    }

    fn mark_error(&self, remote_identity: &str, message: &str) -> Result<()> {
        let mut rows = self.lock()?;
        let row = rows
            .get_mut(remote_identity)
            .ok_or_else(|| not_found(remote_identity))?;

        if !row.status.can_transition_to(FileStatus::Error) {
            return Err(SyncError::InvalidTransition {
                remote_identity: remote_identity.to_string(),
                from: row.status.to_string(),
                to: FileStatus::Error.to_string(),
            });
        }
        row.status = FileStatus::Error;
        row.error_message = Some(message.to_string());
        Ok(())
    }

    fn begin_processing(&self, remote_identity: &str) -> Result<bool> {
        let mut rows = self.lock()?;
        match rows.get_mut(remote_identity) {
            Some(row) if row.status == FileStatus::Fetched => {
                row.status = FileStatus::Processing;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn record_show_match(&self, remote_identity: &str, external_show_id: &str) -> Result<()> {
        let mut rows = self.lock()?;
        let row = rows
            .get_mut(remote_identity)
            .ok_or_else(|| not_found(remote_identity))?;
        row.external_show_id = Some(external_show_id.to_string());
        Ok(())
    }

    fn reset_for_retry(&self, remote_identity: &str) -> Result<bool> {
        let mut rows = self.lock()?;
        match rows.get_mut(remote_identity) {
            Some(row) if row.status == FileStatus::Error => {
                row.status = FileStatus::Fetched;
                row.error_message = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn mark_deleted(&self, remote_identity: &str) -> Result<bool> {
        let mut rows = self.lock()?;
        match rows.get_mut(remote_identity) {
            Some(row) if row.status != FileStatus::Deleted => {
                row.status = FileStatus::Deleted;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn get(&self, remote_identity: &str) -> Result<Option<TrackedFile>> {
        Ok(self.lock()?.get(remote_identity).cloned())
    }

    fn list_by_status(&self, status: FileStatus) -> Result<Vec<TrackedFile>> {
        let rows = self.lock()?;
        let mut records: Vec<TrackedFile> = rows
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.fetched_at
                .cmp(&b.fetched_at)
                .then_with(|| a.remote_identity.cmp(&b.remote_identity))
        });
        Ok(records)
    }

    fn list(&self, query: &FileQuery) -> Result<Page<TrackedFile>> {
        let rows = self.lock()?;
        let term = query.search_term();

        let mut matching: Vec<&TrackedFile> = rows
            .values()
            .filter(|r| query.status.map_or(true, |s| r.status == s))
            .filter(|r| term.as_deref().map_or(true, |t| matches_search(r, t)))
            .collect();

        matching.sort_by(|a, b| {
            let primary = compare(a, b, query.sort_by);
            let primary = if query.descending {
                primary.reverse()
            } else {
                primary
            };
            primary.then_with(|| a.remote_identity.cmp(&b.remote_identity))
        });

        let total_count = matching.len();
        let items = matching
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .cloned()
            .collect();

        Ok(Page {
            items,
            total_count,
            limit: query.limit,
            offset: query.offset,
        })
    }

    fn known_identities(&self) -> Result<HashSet<String>> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    fn known_identities_for_diff(&self, retry_failed_downloads: bool) -> Result<HashSet<String>> {
        let rows = self.lock()?;
        Ok(rows
            .values()
            .filter(|r| {
                !(retry_failed_downloads
                    && r.status == FileStatus::Error
                    && r.hash_value.is_none())
            })
            .map(|r| r.remote_identity.clone())
            .collect())
    }

    fn status_counts(&self) -> Result<StatusCounts> {
        let rows = self.lock()?;
        let mut counts = StatusCounts::default();
        for row in rows.values() {
            counts.add(row.status, 1);
        }
        Ok(counts)
    }
}
