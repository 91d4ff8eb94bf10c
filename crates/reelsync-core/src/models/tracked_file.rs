use super::{Classification, RemoteEntry};
use crate::error::SyncError;
use crate::hashing::{ContentHash, HashAlgorithm};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Lifecycle status of a tracked file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Fetched,
    Processing,
    Routed,
    Error,
    Deleted,
}

impl FileStatus {
    pub const ALL: [FileStatus; 5] = [
        FileStatus::Fetched,
        FileStatus::Processing,
        FileStatus::Routed,
        FileStatus::Error,
        FileStatus::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Fetched => "fetched",
            FileStatus::Processing => "processing",
            FileStatus::Routed => "routed",
            FileStatus::Error => "error",
            FileStatus::Deleted => "deleted",
        }
    }

    /// Status only moves forward, except `error -> fetched` on retry.
    pub fn can_transition_to(&self, next: FileStatus) -> bool {
        use FileStatus::*;
        match (self, next) {
            (Deleted, _) => false,
            (_, Deleted) => true,
            (Fetched, Processing | Routed | Error) => true,
            (Processing, Routed | Error) => true,
            (Routed, Error) => true,
            (Error, Fetched | Error) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FileStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fetched" => Ok(FileStatus::Fetched),
            "processing" => Ok(FileStatus::Processing),
            "routed" => Ok(FileStatus::Routed),
            "error" => Ok(FileStatus::Error),
            "deleted" => Ok(FileStatus::Deleted),
            other => Err(SyncError::Validation {
                field: "status".to_string(),
                message: format!("unknown status '{}'", other),
            }),
        }
    }
}

/// Coarse file category derived from the extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Video,
    Audio,
    Subtitle,
    Nfo,
    Image,
    Archive,
    Unknown,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Video => "video",
            FileKind::Audio => "audio",
            FileKind::Subtitle => "subtitle",
            FileKind::Nfo => "nfo",
            FileKind::Image => "image",
            FileKind::Archive => "archive",
            FileKind::Unknown => "unknown",
        }
    }

    pub fn from_name(name: &str) -> Self {
        let ext = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase());

        match ext.as_deref() {
            Some("mkv" | "mp4" | "avi" | "mov" | "wmv" | "flv" | "webm" | "m4v" | "ts") => {
                FileKind::Video
            }
            Some("mp3" | "flac" | "aac" | "ogg" | "wav" | "m4a" | "opus") => FileKind::Audio,
            Some("srt" | "ass" | "ssa" | "sub" | "vtt" | "idx") => FileKind::Subtitle,
            Some("nfo") => FileKind::Nfo,
            Some("jpg" | "jpeg" | "png" | "gif" | "bmp" | "webp") => FileKind::Image,
            Some("zip" | "rar" | "7z" | "tar" | "gz") => FileKind::Archive,
            _ => FileKind::Unknown,
        }
    }

    /// Inverse of [`FileKind::as_str`]. Unrecognized values map to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "video" => FileKind::Video,
            "audio" => FileKind::Audio,
            "subtitle" => FileKind::Subtitle,
            "nfo" => FileKind::Nfo,
            "image" => FileKind::Image,
            "archive" => FileKind::Archive,
            _ => FileKind::Unknown,
        }
    }
}

/// One row of the lifecycle repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedFile {
    pub remote_identity: String,
    pub name: String,
    pub current_path: Option<String>,
    pub previous_path: Option<String>,
    pub size: u64,
    pub modified_time: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    pub is_dir: bool,
    pub status: FileStatus,
    pub file_kind: FileKind,

    // Locally computed content hash.
    pub hash_value: Option<String>,
    pub hash_algorithm: Option<HashAlgorithm>,
    pub hash_computed_at: Option<DateTime<Utc>>,

    /// Hash-like tag found in the filename. Never compared with `hash_value`.
    pub provided_token: Option<String>,

    pub show_name: Option<String>,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub confidence: Option<f64>,
    pub reasoning: Option<String>,
    pub external_show_id: Option<String>,

    /// Location changes made by `transition_location`. Routing attempts that
    /// fail before the file moves are not counted here; they leave
    /// `error_message` instead.
    pub routing_attempts: u32,
    /// Time of the last location change.
    pub last_routing_attempt: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl TrackedFile {
    /// A bare row for `entry` with status `fetched` and nothing derived yet.
    pub fn from_entry(entry: &RemoteEntry) -> Self {
        Self {
            remote_identity: entry.path.clone(),
            name: entry.name.clone(),
            current_path: None,
            previous_path: None,
            size: entry.size,
            modified_time: entry.modified_time,
            fetched_at: Utc::now(),
            is_dir: entry.is_dir,
            status: FileStatus::Fetched,
            file_kind: FileKind::from_name(&entry.name),
            hash_value: None,
            hash_algorithm: None,
            hash_computed_at: None,
            provided_token: None,
            show_name: None,
            season: None,
            episode: None,
            confidence: None,
            reasoning: None,
            external_show_id: None,
            routing_attempts: 0,
            last_routing_attempt: None,
            error_message: None,
        }
    }

    /// A row for an entry whose download or hash definitively failed.
    pub fn failed(entry: &RemoteEntry, local_path: Option<&Path>, message: impl Into<String>) -> Self {
        let mut record = Self::from_entry(entry);
        record.current_path = local_path.map(|p| p.to_string_lossy().into_owned());
        record.status = FileStatus::Error;
        record.error_message = Some(message.into());
        record
    }

    pub fn with_local_path(mut self, path: &Path) -> Self {
        self.current_path = Some(path.to_string_lossy().into_owned());
        self
    }

    pub fn with_hash(mut self, hash: &ContentHash) -> Self {
        self.hash_value = Some(hash.value.clone());
        self.hash_algorithm = Some(hash.algorithm);
        self.hash_computed_at = Some(hash.computed_at);
        self
    }

    pub fn with_classification(mut self, classification: &Classification) -> Self {
        self.show_name = Some(classification.show_name.clone()).filter(|s| !s.is_empty());
        self.season = classification.season;
        self.episode = classification.episode;
        self.confidence = Some(classification.confidence);
        self.reasoning = Some(classification.reasoning.clone());
        self
    }

    pub fn with_provided_token(mut self, token: Option<String>) -> Self {
        self.provided_token = token;
        self
    }
}
