//! Registry backed by the library directory itself.
//!
//! Every directory under the library root is a show. An optional `show.json`
//! inside it carries the display name, an external id and per-season episode
//! counts used to resolve absolute episode numbers.

use super::{EpisodeRef, MetadataRegistry, ShowRef};
use crate::error::{Result, SyncError};
use crate::naming::{sanitize_component, show_key};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Per-show metadata file name.
pub const METADATA_FILE: &str = "show.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShowMetadata {
    pub name: String,
    pub external_id: Option<String>,
    /// Episode count of season 1, 2, ... in order.
    pub season_episode_counts: Vec<u32>,
}

impl ShowMetadata {
    /// Map an absolute episode number (1-based) onto season and episode.
    pub fn resolve_absolute(&self, absolute: u32) -> Option<(u32, u32)> {
        if absolute == 0 {
            return None;
        }
        let mut remaining = absolute;
        for (index, &count) in self.season_episode_counts.iter().enumerate() {
            if remaining <= count {
                return Some((index as u32 + 1, remaining));
            }
            remaining -= count;
        }
        None
    }
}

#[derive(Debug, Clone)]
pub struct DirectoryRegistry {
    library_root: PathBuf,
}

impl DirectoryRegistry {
    pub fn new(library_root: impl Into<PathBuf>) -> Self {
        Self {
            library_root: library_root.into(),
        }
    }

    pub fn library_root(&self) -> &Path {
        &self.library_root
    }

    async fn read_metadata(show_dir: &Path) -> Option<ShowMetadata> {
        let path = show_dir.join(METADATA_FILE);
        let contents = tokio::fs::read_to_string(&path).await.ok()?;
        match serde_json::from_str(&contents) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                warn!("Ignoring unreadable {}: {}", path.display(), e);
                None
            }
        }
    }

    fn show_ref(dir: PathBuf, dir_name: &str, metadata: Option<&ShowMetadata>) -> ShowRef {
        let name = metadata
            .map(|m| m.name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| dir_name.to_string());
        let id = metadata
            .and_then(|m| m.external_id.clone())
            .unwrap_or_else(|| format!("dir:{}", dir_name));
        ShowRef {
            id,
            name,
            directory: dir,
        }
    }

    async fn show_directories(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut dirs = Vec::new();
        let mut read_dir = match tokio::fs::read_dir(&self.library_root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dirs),
            Err(e) => return Err(SyncError::io_with_path(e, &self.library_root)),
        };

        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| SyncError::io_with_path(e, &self.library_root))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                dirs.push((name.to_string(), entry.path()));
            }
        }

        dirs.sort();
        Ok(dirs)
    }
}

#[async_trait]
impl MetadataRegistry for DirectoryRegistry {
    async fn find_show(&self, name: &str) -> Result<Option<ShowRef>> {
        let key = show_key(name);
        if key.is_empty() {
            return Ok(None);
        }

        for (dir_name, path) in self.show_directories().await? {
            let metadata = Self::read_metadata(&path).await;
            let by_dir = show_key(&dir_name) == key;
            let by_metadata = metadata.as_ref().is_some_and(|m| show_key(&m.name) == key);
            if by_dir || by_metadata {
                debug!("Matched show '{}' to {}", name, path.display());
                return Ok(Some(Self::show_ref(path, &dir_name, metadata.as_ref())));
            }
        }
        Ok(None)
    }

    async fn create_show(&self, name: &str, external_id: Option<&str>) -> Result<ShowRef> {
        let dir_name = sanitize_component(name);
        let dir = self.library_root.join(&dir_name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SyncError::io_with_path(e, &dir))?;

        if let Some(existing) = Self::read_metadata(&dir).await {
            return Ok(Self::show_ref(dir, &dir_name, Some(&existing)));
        }

        let metadata = ShowMetadata {
            name: name.to_string(),
            external_id: external_id.map(str::to_string),
            season_episode_counts: Vec::new(),
        };
        let metadata_path = dir.join(METADATA_FILE);
        let json = serde_json::to_string_pretty(&metadata)?;
        tokio::fs::write(&metadata_path, json)
            .await
            .map_err(|e| SyncError::io_with_path(e, &metadata_path))?;

        info!("Registered show '{}' at {}", name, dir.display());
        Ok(Self::show_ref(dir, &dir_name, Some(&metadata)))
    }

    async fn resolve_episode(
        &self,
        show: &ShowRef,
        season: Option<u32>,
        episode: Option<u32>,
    ) -> Result<Option<EpisodeRef>> {
        match (season, episode) {
            (Some(season), Some(episode)) => Ok(Some(EpisodeRef {
                season,
                episode,
                title: None,
            })),
            (None, Some(absolute)) => {
                let resolved = Self::read_metadata(&show.directory)
                    .await
                    .and_then(|m| m.resolve_absolute(absolute));
                Ok(resolved.map(|(season, episode)| EpisodeRef {
                    season,
                    episode,
                    title: None,
                }))
            }
            _ => Ok(None),
        }
    }
}
