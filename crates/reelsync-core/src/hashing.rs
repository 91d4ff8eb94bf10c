//! Streaming integrity hashing for downloaded files.
//!
//! Files are read in fixed-size chunks so memory use does not depend on file
//! size. Digests are rendered as uppercase hex; CRC32 yields exactly 8 chars.

use crate::config::HashSettings;
use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Supported checksum algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Crc32,
    Sha256,
    Blake3,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Crc32 => "crc32",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Blake3 => "blake3",
        }
    }

    /// Length of the hex digest.
    pub fn digest_len(&self) -> usize {
        match self {
            HashAlgorithm::Crc32 => 8,
            HashAlgorithm::Sha256 | HashAlgorithm::Blake3 => 64,
        }
    }
}

impl std::str::FromStr for HashAlgorithm {
    type Err = SyncError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "crc32" => Ok(HashAlgorithm::Crc32),
            "sha256" => Ok(HashAlgorithm::Sha256),
            "blake3" => Ok(HashAlgorithm::Blake3),
            other => Err(SyncError::Validation {
                field: "hash_algorithm".to_string(),
                message: format!("unsupported algorithm '{}'", other),
            }),
        }
    }
}

/// A computed digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentHash {
    /// Uppercase hex digest.
    pub value: String,
    pub algorithm: HashAlgorithm,
    pub computed_at: DateTime<Utc>,
}

enum StreamingHasher {
    Crc32(crc32fast::Hasher),
    Sha256(Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl StreamingHasher {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Crc32 => StreamingHasher::Crc32(crc32fast::Hasher::new()),
            HashAlgorithm::Sha256 => StreamingHasher::Sha256(Sha256::new()),
            HashAlgorithm::Blake3 => StreamingHasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    fn update(&mut self, chunk: &[u8]) {
        match self {
            StreamingHasher::Crc32(h) => h.update(chunk),
            StreamingHasher::Sha256(h) => h.update(chunk),
            StreamingHasher::Blake3(h) => {
                h.update(chunk);
            }
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            StreamingHasher::Crc32(h) => format!("{:08X}", h.finalize()),
            StreamingHasher::Sha256(h) => hex::encode_upper(h.finalize()),
            StreamingHasher::Blake3(h) => hex::encode_upper(h.finalize().as_bytes()),
        }
    }
}

/// Chunked file hasher.
#[derive(Debug, Clone)]
pub struct IntegrityHasher {
    algorithm: HashAlgorithm,
    chunk_size: usize,
}

impl Default for IntegrityHasher {
    fn default() -> Self {
        Self::from_settings(&HashSettings::default())
    }
}

impl IntegrityHasher {
    pub fn new(algorithm: HashAlgorithm, chunk_size: usize) -> Self {
        Self {
            algorithm,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn from_settings(settings: &HashSettings) -> Self {
        Self::new(settings.algorithm, settings.chunk_size)
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Hash everything `reader` yields.
    pub fn hash_reader<R: Read>(&self, mut reader: R) -> std::io::Result<String> {
        let mut hasher = StreamingHasher::new(self.algorithm);
        let mut buffer = vec![0u8; self.chunk_size];
        loop {
            let bytes_read = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            hasher.update(&buffer[..bytes_read]);
        }
        Ok(hasher.finalize_hex())
    }

    pub fn hash_bytes(&self, data: &[u8]) -> String {
        let mut hasher = StreamingHasher::new(self.algorithm);
        for chunk in data.chunks(self.chunk_size) {
            hasher.update(chunk);
        }
        hasher.finalize_hex()
    }

    /// Hash a file on the current thread.
    pub fn hash_file(&self, path: impl AsRef<Path>) -> Result<ContentHash> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| hash_error(path, e))?;
        let value = self.hash_reader(file).map_err(|e| hash_error(path, e))?;

        Ok(ContentHash {
            value,
            algorithm: self.algorithm,
            computed_at: Utc::now(),
        })
    }

    /// Hash a file on the blocking pool.
    pub async fn hash_file_async(&self, path: impl AsRef<Path>) -> Result<ContentHash> {
        let path = path.as_ref().to_path_buf();
        let hasher = self.clone();

        tokio::task::spawn_blocking(move || hasher.hash_file(&path))
            .await
            .map_err(|e| SyncError::Other(format!("Hash task panicked: {}", e)))?
    }
}

fn hash_error(path: &Path, err: std::io::Error) -> SyncError {
    SyncError::Hash {
        path: path.to_path_buf(),
        message: err.to_string(),
        source: Some(err),
    }
}
