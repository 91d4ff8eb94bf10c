//! SQLite lifecycle repository.

use super::{FileQuery, LifecycleRepository, Page, StatusCounts};
use crate::error::{Result, SyncError};
use crate::hashing::HashAlgorithm;
use crate::models::{FileKind, FileStatus, TrackedFile};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

const COLUMNS: &str = "remote_identity, name, current_path, previous_path, size, modified_time, \
     fetched_at, is_dir, status, file_kind, hash_value, hash_algorithm, hash_computed_at, \
     provided_token, show_name, season, episode, confidence, reasoning, external_show_id, \
     routing_attempts, last_routing_attempt, error_message";

/// Lifecycle repository backed by a single SQLite file.
///
/// Thread-safe via an internal mutex on the connection.
pub struct SqliteRepository {
    db_path: Option<PathBuf>,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Open or create the database at `db_path`.
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| SyncError::Io {
                    message: format!("Failed to create directory {}", parent.display()),
                    path: Some(parent.to_path_buf()),
                    source: Some(e),
                })?;
            }
        }

        let conn = Connection::open(&db_path).map_err(|e| SyncError::Database {
            message: format!("Failed to open {}: {}", db_path.display(), e),
            source: Some(e),
        })?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA busy_timeout=30000;
            PRAGMA synchronous=NORMAL;
            ",
        )?;

        Self::from_connection(conn, Some(db_path))
    }

    /// A private in-memory database, mostly for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(conn: Connection, db_path: Option<PathBuf>) -> Result<Self> {
        Self::ensure_schema(&conn)?;
        Ok(Self {
            db_path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn ensure_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tracked_files (
                remote_identity TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                current_path TEXT,
                previous_path TEXT,
                size INTEGER NOT NULL,
                modified_time TEXT NOT NULL,
                fetched_at TEXT NOT NULL,
                is_dir INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                file_kind TEXT NOT NULL,
                hash_value TEXT,
                hash_algorithm TEXT,
                hash_computed_at TEXT,
                provided_token TEXT,
                show_name TEXT,
                season INTEGER,
                episode INTEGER,
                confidence REAL,
                reasoning TEXT,
                external_show_id TEXT,
                routing_attempts INTEGER NOT NULL DEFAULT 0,
                last_routing_attempt TEXT,
                error_message TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_tracked_status
                ON tracked_files(status, fetched_at);

            CREATE INDEX IF NOT EXISTS idx_tracked_fetched
                ON tracked_files(fetched_at);
            "#,
        )
        .map_err(|e| SyncError::Database {
            message: format!("Failed to initialize schema: {}", e),
            source: Some(e),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SyncError::database("Failed to acquire connection lock"))
    }

    fn row_to_record(row: &Row) -> rusqlite::Result<TrackedFile> {
        let size: i64 = row.get(4)?;
        let status: String = row.get(8)?;
        let file_kind: String = row.get(9)?;
        let hash_algorithm: Option<String> = row.get(11)?;

        Ok(TrackedFile {
            remote_identity: row.get(0)?,
            name: row.get(1)?,
            current_path: row.get(2)?,
            previous_path: row.get(3)?,
            size: size.max(0) as u64,
            modified_time: parse_ts(5, row.get(5)?)?,
            fetched_at: parse_ts(6, row.get(6)?)?,
            is_dir: row.get(7)?,
            status: status
                .parse::<FileStatus>()
                .map_err(|e| conversion_error(8, e))?,
            file_kind: FileKind::parse(&file_kind),
            hash_value: row.get(10)?,
            hash_algorithm: hash_algorithm
                .map(|a| a.parse::<HashAlgorithm>())
                .transpose()
                .map_err(|e| conversion_error(11, e))?,
            hash_computed_at: parse_opt_ts(12, row.get(12)?)?,
            provided_token: row.get(13)?,
            show_name: row.get(14)?,
            season: row.get(15)?,
            episode: row.get(16)?,
            confidence: row.get(17)?,
            reasoning: row.get(18)?,
            external_show_id: row.get(19)?,
            routing_attempts: row.get(20)?,
            last_routing_attempt: parse_opt_ts(21, row.get(21)?)?,
            error_message: row.get(22)?,
        })
    }

    fn fetch(conn: &Connection, remote_identity: &str) -> Result<Option<TrackedFile>> {
        let sql = format!("SELECT {} FROM tracked_files WHERE remote_identity = ?1", COLUMNS);
        Ok(conn
            .query_row(&sql, params![remote_identity], Self::row_to_record)
            .optional()?)
    }

    fn current_status(conn: &Connection, remote_identity: &str) -> Result<FileStatus> {
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM tracked_files WHERE remote_identity = ?1",
                params![remote_identity],
                |row| row.get(0),
            )
            .optional()?;
        status
            .ok_or_else(|| SyncError::NotFound {
                remote_identity: remote_identity.to_string(),
            })?
            .parse()
    }

    fn collect_ids(conn: &Connection, sql: &str) -> Result<HashSet<String>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = HashSet::new();
        for row in rows {
            ids.insert(row?);
        }
        Ok(ids)
    }
}

fn fmt_ts(ts: &DateTime<Utc>) -> String {
    // Fixed width so lexical order matches time order.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|r| parse_ts(idx, r)).transpose()
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

impl LifecycleRepository for SqliteRepository {
    fn upsert_by_remote_identity(&self, record: &TrackedFile) -> Result<()> {
        let conn = self.lock()?;
        let sql = format!(
            "INSERT INTO tracked_files ({})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21, ?22, ?23)
             ON CONFLICT(remote_identity) DO UPDATE SET
                 name=excluded.name,
                 current_path=excluded.current_path,
                 previous_path=excluded.previous_path,
                 size=excluded.size,
                 modified_time=excluded.modified_time,
                 fetched_at=excluded.fetched_at,
                 is_dir=excluded.is_dir,
                 status=excluded.status,
                 file_kind=excluded.file_kind,
                 hash_value=excluded.hash_value,
                 hash_algorithm=excluded.hash_algorithm,
                 hash_computed_at=excluded.hash_computed_at,
                 provided_token=COALESCE(excluded.provided_token, tracked_files.provided_token),
                 show_name=excluded.show_name,
                 season=excluded.season,
                 episode=excluded.episode,
                 confidence=excluded.confidence,
                 reasoning=excluded.reasoning,
                 external_show_id=excluded.external_show_id,
                 routing_attempts=excluded.routing_attempts,
                 last_routing_attempt=excluded.last_routing_attempt,
                 error_message=excluded.error_message",
            COLUMNS
        );

        conn.execute(
            &sql,
            params![
                record.remote_identity,
                record.name,
                record.current_path,
                record.previous_path,
                i64::try_from(record.size).unwrap_or(i64::MAX),
                fmt_ts(&record.modified_time),
                fmt_ts(&record.fetched_at),
                record.is_dir,
                record.status.as_str(),
                record.file_kind.as_str(),
                record.hash_value,
                record.hash_algorithm.map(|a| a.as_str()),
                record.hash_computed_at.as_ref().map(fmt_ts),
                record.provided_token,
                record.show_name,
                record.season,
                record.episode,
                record.confidence,
                record.reasoning,
                record.external_show_id,
                record.routing_attempts,
                record.last_routing_attempt.as_ref().map(fmt_ts),
                record.error_message,
            ],
        )?;

        debug!("Upserted {} ({})", record.remote_identity, record.status);
        Ok(())
    }

    fn transition_location(
        &self,
        remote_identity: &str,
        new_path: &str,
        new_status: FileStatus,
    ) -> Result<TrackedFile> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let current = Self::current_status(&tx, remote_identity)?;
        if !current.can_transition_to(new_status) {
            return Err(SyncError::InvalidTransition {
                remote_identity: remote_identity.to_string(),
                from: current.to_string(),
                to: new_status.to_string(),
            });
        }

        tx.execute(
            "UPDATE tracked_files SET
                 previous_path = current_path,
                 current_path = ?2,
                 status = ?3,
                 routing_attempts = routing_attempts + 1,
                 last_routing_attempt = ?4
             WHERE remote_identity = ?1",
            params![
                remote_identity,
                new_path,
                new_status.as_str(),
                fmt_ts(&Utc::now())
            ],
        )?;

        let record = Self::fetch(&tx, remote_identity)?.ok_or_else(|| SyncError::NotFound {
            remote_identity: remote_identity.to_string(),
        })?;
        tx.commit()?;

        debug!(
            "Moved {} to {} ({})",
            remote_identity, new_path, new_status
        );
        Ok(record)
    }

    fn mark_error(&self, remote_identity: &str, message: &str) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let current = Self::current_status(&tx, remote_identity)?;
        if !current.can_transition_to(FileStatus::Error) {
            return Err(SyncError::InvalidTransition {
                remote_identity: remote_identity.to_string(),
                from: current.to_string(),
                to: FileStatus::Error.to_string(),
            });
        }

        tx.execute(
            "UPDATE tracked_files SET status = 'error', error_message = ?2
             WHERE remote_identity = ?1",
            params![remote_identity, message],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn begin_processing(&self, remote_identity: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE tracked_files SET status = 'processing'
             WHERE remote_identity = ?1 AND status = 'fetched'",
            params![remote_identity],
        )?;
        Ok(changed > 0)
    }

    fn record_show_match(&self, remote_identity: &str, external_show_id: &str) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE tracked_files SET external_show_id = ?2 WHERE remote_identity = ?1",
            params![remote_identity, external_show_id],
        )?;
        if changed == 0 {
            return Err(SyncError::NotFound {
                remote_identity: remote_identity.to_string(),
            });
        }
        Ok(())
    }

    fn reset_for_retry(&self, remote_identity: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE tracked_files SET status = 'fetched', error_message = NULL
             WHERE remote_identity = ?1 AND status = 'error'",
            params![remote_identity],
        )?;
        Ok(changed > 0)
    }

    fn mark_deleted(&self, remote_identity: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE tracked_files SET status = 'deleted'
             WHERE remote_identity = ?1 AND status != 'deleted'",
            params![remote_identity],
        )?;
        Ok(changed > 0)
    }

    fn get(&self, remote_identity: &str) -> Result<Option<TrackedFile>> {
        let conn = self.lock()?;
        Self::fetch(&conn, remote_identity)
    }

    fn list_by_status(&self, status: FileStatus) -> Result<Vec<TrackedFile>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM tracked_files WHERE status = ?1
             ORDER BY fetched_at ASC, remote_identity ASC",
            COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![status.as_str()], Self::row_to_record)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn list(&self, query: &FileQuery) -> Result<Page<TrackedFile>> {
        let conn = self.lock()?;

        let mut where_clause = String::from("WHERE 1=1");
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = query.status {
            where_clause.push_str(" AND status = ?");
            params_vec.push(Box::new(status.as_str()));
        }
        if let Some(term) = query.search_term() {
            where_clause.push_str(
                " AND (LOWER(name) LIKE ? ESCAPE '\\' \
                 OR LOWER(remote_identity) LIKE ? ESCAPE '\\' \
                 OR LOWER(COALESCE(show_name, '')) LIKE ? ESCAPE '\\')",
            );
            let pattern = escape_like(&term);
            for _ in 0..3 {
                params_vec.push(Box::new(pattern.clone()));
            }
        }
        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();

        let count_sql = format!("SELECT COUNT(*) FROM tracked_files {}", where_clause);
        let total_count: i64 = conn.query_row(&count_sql, params_refs.as_slice(), |row| row.get(0))?;

        let sql = format!(
            "SELECT {} FROM tracked_files {} ORDER BY {} {}, remote_identity ASC LIMIT {} OFFSET {}",
            COLUMNS,
            where_clause,
            query.sort_by.column(),
            if query.descending { "DESC" } else { "ASC" },
            query.limit,
            query.offset
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_refs.as_slice(), Self::row_to_record)?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }

        Ok(Page {
            items,
            total_count: total_count.max(0) as usize,
            limit: query.limit,
            offset: query.offset,
        })
    }

    fn known_identities(&self) -> Result<HashSet<String>> {
        let conn = self.lock()?;
        Self::collect_ids(&conn, "SELECT remote_identity FROM tracked_files")
    }

    fn known_identities_for_diff(&self, retry_failed_downloads: bool) -> Result<HashSet<String>> {
        let conn = self.lock()?;
        if retry_failed_downloads {
            Self::collect_ids(
                &conn,
                "SELECT remote_identity FROM tracked_files
                 WHERE NOT (status = 'error' AND hash_value IS NULL)",
            )
        } else {
            Self::collect_ids(&conn, "SELECT remote_identity FROM tracked_files")
        }
    }

    fn status_counts(&self) -> Result<StatusCounts> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tracked_files GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, n) = row?;
            counts.add(status.parse()?, n.max(0) as usize);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::super::contract;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_contract_in_memory() {
        contract::run_all(|| Box::new(SqliteRepository::open_in_memory().unwrap()));
    }

    #[test]
    fn test_persists_across_reopen() {
        let temp = TempDir::new().unwrap();
        let db_path = temp.path().join("nested").join("reelsync.db");

        let mut rec = contract::record("/r/keep.mkv", Some("A4DD1E71"));
        rec.season = Some(2);
        rec.episode = Some(5);
        rec.confidence = Some(0.95);
        rec.hash_value = Some("CBF43926".to_string());
        rec.hash_algorithm = Some(HashAlgorithm::Crc32);
        {
            let repo = SqliteRepository::open(&db_path).unwrap();
            repo.upsert_by_remote_identity(&rec).unwrap();
        }

        let repo = SqliteRepository::open(&db_path).unwrap();
        assert_eq!(repo.db_path(), Some(db_path.as_path()));
        let stored = repo.get("/r/keep.mkv").unwrap().unwrap();
        assert_eq!(stored.provided_token.as_deref(), Some("A4DD1E71"));
        assert_eq!(stored.season, Some(2));
        assert_eq!(stored.episode, Some(5));
        assert_eq!(stored.confidence, Some(0.95));
        assert_eq!(stored.hash_algorithm, Some(HashAlgorithm::Crc32));
        assert_eq!(stored.modified_time, rec.modified_time);
    }

    #[test]
    fn test_search_escapes_wildcards() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        repo.upsert_by_remote_identity(&contract::record("/r/100%.mkv", None))
            .unwrap();
        repo.upsert_by_remote_identity(&contract::record("/r/1000.mkv", None))
            .unwrap();

        let page = repo.list(&FileQuery::default().with_search("100%")).unwrap();
        assert_eq!(page.total_count, 1);
        assert_eq!(page.items[0].remote_identity, "/r/100%.mkv");
    }

    #[test]
    fn test_concurrent_upserts() {
        let repo = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let repo = Arc::clone(&repo);
                std::thread::spawn(move || {
                    repo.upsert_by_remote_identity(&contract::record(&format!("/r/{}.mkv", i), None))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(repo.known_identities().unwrap().len(), 8);
    }
}
