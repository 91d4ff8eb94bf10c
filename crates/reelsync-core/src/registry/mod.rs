//! Show metadata registry consulted by the router.

mod directory;

pub use directory::{DirectoryRegistry, ShowMetadata};

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A show known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShowRef {
    /// Registry identifier, recorded on routed rows as `external_show_id`.
    pub id: String,
    pub name: String,
    /// Library directory the show's seasons live in.
    pub directory: PathBuf,
}

/// A resolved episode. Always carries both season and episode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeRef {
    pub season: u32,
    pub episode: u32,
    pub title: Option<String>,
}

/// Lookup and registration of shows and episodes.
#[async_trait]
pub trait MetadataRegistry: Send + Sync {
    /// Find a show by name.
    async fn find_show(&self, name: &str) -> Result<Option<ShowRef>>;

    /// Register a new show.
    async fn create_show(&self, name: &str, external_id: Option<&str>) -> Result<ShowRef>;

    /// Resolve an episode of `show`. `season` may be absent when `episode` is
    /// an absolute number.
    async fn resolve_episode(
        &self,
        show: &ShowRef,
        season: Option<u32>,
        episode: Option<u32>,
    ) -> Result<Option<EpisodeRef>>;
}
