//! Configuration for reelsync.
//!
//! Fixed values live on the const-holder structs at the top. `SyncConfig` is
//! the user-facing configuration, loaded from JSON with every field defaulted.

use crate::error::{Result, SyncError};
use crate::hashing::HashAlgorithm;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Transfer-related constants.
pub struct TransferConfig;

impl TransferConfig {
    pub const DOWNLOAD_TEMP_SUFFIX: &'static str = ".part";
    pub const LIST_TIMEOUT: Duration = Duration::from_secs(120);
    /// A fetch that yields no data for this long is treated as a dropped connection.
    pub const STALL_TIMEOUT: Duration = Duration::from_secs(60);
}

/// Classifier-related constants.
pub struct ClassifierConfig;

impl ClassifierConfig {
    pub const OLLAMA_DEFAULT_ENDPOINT: &'static str = "http://localhost:11434";
    pub const OPENAI_DEFAULT_ENDPOINT: &'static str = "https://api.openai.com";
    pub const ANTHROPIC_DEFAULT_ENDPOINT: &'static str = "https://api.anthropic.com";
    /// Key variable read when `api_key_env` is unset.
    pub const ANTHROPIC_DEFAULT_KEY_ENV: &'static str = "ANTHROPIC_API_KEY";
    pub const ANTHROPIC_API_VERSION: &'static str = "2023-06-01";
    pub const DEFAULT_MODEL: &'static str = "llama3.2";
    pub const MAX_RESPONSE_TOKENS: u32 = 256;
}

/// Top-level configuration of a sync run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Remote directory that is listed recursively each run.
    pub remote_root: String,
    /// Local directory downloads land in before routing.
    pub staging_dir: PathBuf,
    /// Library root that routed files are moved into.
    pub library_dir: PathBuf,
    /// SQLite database holding the lifecycle repository.
    pub database_path: PathBuf,
    /// Plan only: nothing is downloaded, moved or written.
    pub dry_run: bool,
    pub transfer: TransferSettings,
    pub hashing: HashSettings,
    pub classifier: ClassifierSettings,
    pub filters: FilterSettings,
    pub routing: RoutingSettings,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_root: "/".to_string(),
            staging_dir: PathBuf::from("incoming"),
            library_dir: PathBuf::from("library"),
            database_path: PathBuf::from("reelsync.db"),
            dry_run: false,
            transfer: TransferSettings::default(),
            hashing: HashSettings::default(),
            classifier: ClassifierSettings::default(),
            filters: FilterSettings::default(),
            routing: RoutingSettings::default(),
        }
    }
}

impl SyncConfig {
    /// Load and validate a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| SyncError::io_with_path(e, path))?;
        let config: SyncConfig = serde_json::from_str(&raw).map_err(|e| SyncError::Config {
            message: format!("Failed to parse {}: {}", path.display(), e),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.transfer.workers == 0 {
            return Err(invalid("transfer.workers", "must be at least 1"));
        }
        if self.transfer.max_attempts == 0 {
            return Err(invalid("transfer.max_attempts", "must be at least 1"));
        }
        if self.hashing.chunk_size == 0 {
            return Err(invalid("hashing.chunk_size", "must be greater than zero"));
        }
        let threshold = self.classifier.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(invalid(
                "classifier.confidence_threshold",
                format!("{} is outside [0, 1]", threshold),
            ));
        }
        if self.classifier.enabled {
            url::Url::parse(&self.classifier.endpoint).map_err(|e| {
                invalid(
                    "classifier.endpoint",
                    format!("{}: {}", self.classifier.endpoint, e),
                )
            })?;
        }
        Ok(())
    }
}

fn invalid(field: &str, message: impl Into<String>) -> SyncError {
    SyncError::Validation {
        field: field.to_string(),
        message: message.into(),
    }
}

/// Worker pool and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    pub workers: usize,
    /// Attempts per file, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    /// Re-download rows whose earlier download failed.
    pub retry_failed_downloads: bool,
}

impl TransferSettings {
    pub const DEFAULT_WORKERS: usize = 4;
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
    pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
    pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            workers: Self::DEFAULT_WORKERS,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: Self::DEFAULT_BASE_DELAY_MS,
            max_delay_ms: Self::DEFAULT_MAX_DELAY_MS,
            jitter: true,
            retry_failed_downloads: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HashSettings {
    pub algorithm: HashAlgorithm,
    pub chunk_size: usize,
}

impl HashSettings {
    /// 1 MiB.
    pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;
}

impl Default for HashSettings {
    fn default() -> Self {
        Self {
            algorithm: HashAlgorithm::Crc32,
            chunk_size: Self::DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Which semantic classifier backend to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierBackend {
    Ollama,
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierSettings {
    /// Consult the semantic classifier for every filename.
    pub enabled: bool,
    pub backend: ClassifierBackend,
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the API key, if the backend needs one.
    pub api_key_env: Option<String>,
    /// Minimum confidence for a semantic result to replace the deterministic one.
    pub confidence_threshold: f64,
    pub timeout_ms: u64,
    /// Funnel every semantic call through a single gate.
    pub serialize_calls: bool,
}

impl ClassifierSettings {
    pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;
    pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: ClassifierBackend::Ollama,
            endpoint: ClassifierConfig::OLLAMA_DEFAULT_ENDPOINT.to_string(),
            model: ClassifierConfig::DEFAULT_MODEL.to_string(),
            api_key_env: None,
            confidence_threshold: Self::DEFAULT_CONFIDENCE_THRESHOLD,
            timeout_ms: Self::DEFAULT_TIMEOUT_MS,
            serialize_calls: true,
        }
    }
}

/// Which remote entries are worth tracking at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    /// Lowercase extensions without the dot.
    pub excluded_extensions: Vec<String>,
    /// Lowercase substrings matched against file and directory names.
    pub excluded_keywords: Vec<String>,
    /// Entries modified more recently than this are left for a later run.
    pub min_age_secs: u64,
    pub include_directories: bool,
}

impl FilterSettings {
    pub const DEFAULT_MIN_AGE_SECS: u64 = 60;
    pub const DEFAULT_EXCLUDED_EXTENSIONS: &'static [&'static str] =
        &["jpg", "jpeg", "png", "gif", "bmp", "nfo", "sfv"];
    pub const DEFAULT_EXCLUDED_KEYWORDS: &'static [&'static str] =
        &["sample", "screens", "thumbs.db", ".ds_store"];
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            excluded_extensions: Self::DEFAULT_EXCLUDED_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            excluded_keywords: Self::DEFAULT_EXCLUDED_KEYWORDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            min_age_secs: Self::DEFAULT_MIN_AGE_SECS,
            include_directories: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSettings {
    /// Route fetched files at the end of every sync run.
    pub enabled: bool,
    /// Create a registry entry when a show is not found.
    pub auto_register_shows: bool,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_register_shows: false,
        }
    }
}
