//! Reelsync Core - Headless library that mirrors new media from a remote
//! source into a local library.
//!
//! A run lists the remote, diffs the listing against the lifecycle
//! repository, downloads new entries through a bounded worker pool, hashes and
//! classifies each file, persists one row per remote identity and finally
//! routes fetched files into `<show>/Season NN/`.
//!
//! # Example
//!
//! ```rust,ignore
//! use reelsync_core::{DirectoryRegistry, LocalDirSource, SqliteRepository, SyncConfig, SyncPipeline};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> reelsync_core::Result<()> {
//!     let config = SyncConfig::from_json_file("reelsync.json")?;
//!     let repository = Arc::new(SqliteRepository::open(&config.database_path)?);
//!     let source = Arc::new(LocalDirSource::new("/mnt/seedbox"));
//!     let registry = Arc::new(DirectoryRegistry::new(&config.library_dir));
//!
//!     let report = SyncPipeline::builder(config, repository, source)
//!         .registry(registry)
//!         .build()?
//!         .run()
//!         .await?;
//!     println!("fetched {} routed {}", report.fetched, report.routed);
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod classifier;
pub mod config;
pub mod diff;
pub mod error;
pub mod hashing;
pub mod models;
pub mod naming;
pub mod pipeline;
pub mod registry;
pub mod remote;
pub mod repository;
pub mod router;
pub mod transfer;

// Re-export commonly used types
pub use cancel::CancellationToken;
pub use classifier::{create_semantic_classifier, FilenameClassifier, SemanticClassifier};
pub use config::SyncConfig;
pub use diff::{DiffEngine, DiffOutcome, EntryFilter};
pub use error::{Result, SyncError, TransferError};
pub use hashing::{ContentHash, HashAlgorithm, IntegrityHasher};
pub use models::{Classification, FileStatus, RemoteEntry, TrackedFile};
pub use pipeline::{
    BootstrapReport, FailureStage, FileFailure, RunReport, SyncPipeline, SyncPipelineBuilder,
};
pub use registry::{DirectoryRegistry, MetadataRegistry, ShowRef};
pub use remote::{FetchHold, LocalDirSource, MemoryRemote, RemoteConnection, RemoteSource};
pub use repository::{
    FileQuery, LifecycleRepository, MemoryRepository, Page, SqliteRepository, StatusCounts,
};
pub use router::{reset_failed_rows, RetrySummary, Router, RoutingReport};
pub use transfer::{RetryPolicy, TransferPool};
