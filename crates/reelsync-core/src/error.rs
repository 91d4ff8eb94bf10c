//! Error types for reelsync.
//!
//! `SyncError` covers everything the library can report. `TransferError` is kept
//! separate because the transfer pool needs its transient/permanent split to
//! drive retries.

use std::path::PathBuf;
use thiserror::Error;

/// Failure of a single remote operation (connect, list, fetch).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    /// Timeouts, resets, dropped connections. Retried with backoff.
    #[error("transient transfer failure for {path}: {message}")]
    Transient { path: String, message: String },

    /// Missing files, invalid paths, permission problems. Never retried.
    #[error("permanent transfer failure for {path}: {message}")]
    Permanent { path: String, message: String },
}

impl TransferError {
    pub fn transient(path: impl Into<String>, message: impl Into<String>) -> Self {
        TransferError::Transient {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn permanent(path: impl Into<String>, message: impl Into<String>) -> Self {
        TransferError::Permanent {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Classify an IO error raised while working on `path`.
    pub fn from_io(path: impl Into<String>, err: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        let path = path.into();
        match err.kind() {
            ErrorKind::NotFound
            | ErrorKind::PermissionDenied
            | ErrorKind::InvalidInput
            | ErrorKind::InvalidData
            | ErrorKind::Unsupported => TransferError::permanent(path, err.to_string()),
            _ => TransferError::transient(path, err.to_string()),
        }
    }

    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Transient { .. })
    }

    pub fn path(&self) -> &str {
        match self {
            TransferError::Transient { path, .. } | TransferError::Permanent { path, .. } => path,
        }
    }
}

/// Main error type for the reelsync library.
#[derive(Debug, Error)]
pub enum SyncError {
    // Remote errors
    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("Remote source unavailable: {message}")]
    RemoteUnavailable { message: String },

    // Per-file pipeline errors
    #[error("Hash computation failed for {path:?}: {message}")]
    Hash {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Classification failed: {message}")]
    Classification { message: String },

    #[error("Routing failed for {remote_identity}: {message}")]
    Routing {
        remote_identity: String,
        message: String,
    },

    // Persistence errors
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("Tracked file not found: {remote_identity}")]
    NotFound { remote_identity: String },

    #[error("Invalid status transition for {remote_identity}: {from} -> {to}")]
    InvalidTransition {
        remote_identity: String,
        from: String,
        to: String,
    },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // HTTP errors (semantic classifier backends)
    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for reelsync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout(std::time::Duration::from_secs(0))
        } else {
            SyncError::Network {
                message: err.to_string(),
            }
        }
    }
}

impl SyncError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        SyncError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    pub fn routing(remote_identity: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Routing {
            remote_identity: remote_identity.into(),
            message: message.into(),
        }
    }

    pub fn database(message: impl Into<String>) -> Self {
        SyncError::Database {
            message: message.into(),
            source: None,
        }
    }

    /// Whether this error is worth retrying at a higher level.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transfer(e) => e.is_retryable(),
            SyncError::Network { .. } | SyncError::Timeout(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_io_classification() {
        let not_found = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert!(!TransferError::from_io("/a", &not_found).is_retryable());

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert!(!TransferError::from_io("/a", &denied).is_retryable());

        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(TransferError::from_io("/a", &reset).is_retryable());

        let timeout = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert!(TransferError::from_io("/a", &timeout).is_retryable());
    }

    #[test]
    fn test_transfer_error_path() {
        let err = TransferError::permanent("/remote/a.mkv", "missing");
        assert_eq!(err.path(), "/remote/a.mkv");
        assert_eq!(
            err.to_string(),
            "permanent transfer failure for /remote/a.mkv: missing"
        );
    }

    #[test]
    fn test_sync_error_retryable() {
        let err: SyncError = TransferError::transient("/a", "reset").into();
        assert!(err.is_retryable());
        assert!(!SyncError::routing("/a", "no show").is_retryable());
    }

    #[test]
    fn test_io_with_path() {
        let err = SyncError::io_with_path(
            io::Error::new(io::ErrorKind::NotFound, "missing"),
            "/tmp/x",
        );
        match err {
            SyncError::Io { path, .. } => assert_eq!(path, Some(PathBuf::from("/tmp/x"))),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
