//! One sync run: list, diff, download, hash, classify, persist, route.

use crate::cancel::CancellationToken;
use crate::classifier::{extract_provided_token, FilenameClassifier};
use crate::config::SyncConfig;
use crate::diff::DiffEngine;
use crate::error::{Result, SyncError};
use crate::hashing::IntegrityHasher;
use crate::models::{FileStatus, RemoteEntry, TrackedFile};
use crate::registry::MetadataRegistry;
use crate::remote::RemoteSource;
use crate::repository::LifecycleRepository;
use crate::router::{Router, RoutingReport};
use crate::transfer::{RetryPolicy, TransferPool};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Stage of the per-file pipeline a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    Download,
    Hash,
    Persist,
    Routing,
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureStage::Download => "download",
            FailureStage::Hash => "hash",
            FailureStage::Persist => "persist",
            FailureStage::Routing => "routing",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileFailure {
    pub remote_identity: String,
    pub stage: FailureStage,
    pub message: String,
}

/// Summary of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub cancelled: bool,
    /// Entries in the remote listing.
    pub listed: usize,
    /// Entries the diff reported as new.
    pub new_entries: usize,
    pub fetched: usize,
    /// Directory rows recorded when directories are tracked.
    pub directories: usize,
    pub routed: usize,
    pub errored: usize,
    /// New entries not started because the run was cancelled.
    pub skipped: usize,
    /// Dry run only: what would have been downloaded.
    pub planned_downloads: Vec<String>,
    pub failures: Vec<FileFailure>,
    pub routing: Option<RoutingReport>,
}

impl RunReport {
    fn new(run_id: Uuid, dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            started_at: now,
            finished_at: now,
            dry_run,
            cancelled: false,
            listed: 0,
            new_entries: 0,
            fetched: 0,
            directories: 0,
            routed: 0,
            errored: 0,
            skipped: 0,
            planned_downloads: Vec::new(),
            failures: Vec::new(),
            routing: None,
        }
    }
}

/// Summary of [`SyncPipeline::bootstrap`].
#[derive(Debug, Clone, Serialize)]
pub struct BootstrapReport {
    pub dry_run: bool,
    pub listed: usize,
    /// Identities that were not known before.
    pub new_entries: usize,
    /// Rows written. Zero on a dry run.
    pub recorded: usize,
    pub entries: Vec<String>,
}

enum FileOutcome {
    Fetched,
    Directory,
    Failed(FileFailure),
    Skipped,
}

/// A configured sync run. Every collaborator is injected through
/// [`SyncPipelineBuilder`].
pub struct SyncPipeline {
    repository: Arc<dyn LifecycleRepository>,
    transfers: TransferPool,
    hasher: IntegrityHasher,
    classifier: Arc<FilenameClassifier>,
    diff: DiffEngine,
    router: Option<Router>,
    remote_root: String,
    workers: usize,
    retry_failed_downloads: bool,
    dry_run: bool,
    cancel: CancellationToken,
}

impl SyncPipeline {
    pub fn builder(
        config: SyncConfig,
        repository: Arc<dyn LifecycleRepository>,
        source: Arc<dyn RemoteSource>,
    ) -> SyncPipelineBuilder {
        SyncPipelineBuilder::new(config, repository, source)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Execute one run.
    ///
    /// Fails only when the remote cannot be listed or the repository cannot
    /// be read. Per-file problems are recorded on their rows and reported.
    pub async fn run(&self) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let mut report = RunReport::new(run_id, self.dry_run);
        info!(
            %run_id,
            source = %self.transfers.describe_source(),
            root = %self.remote_root,
            dry_run = self.dry_run,
            "Starting sync run"
        );

        let listing = self
            .transfers
            .list(&self.remote_root, true)
            .await
            .map_err(|e| SyncError::RemoteUnavailable {
                message: e.to_string(),
            })?;
        let known = self
            .repository
            .known_identities_for_diff(self.retry_failed_downloads)?;
        let diff = self.diff.diff(listing, &known);
        report.listed = diff.listed;
        report.new_entries = diff.new_entries.len();
        info!(
            %run_id,
            listed = diff.listed,
            new = diff.new_entries.len(),
            known = diff.already_known,
            filtered = diff.filtered,
            "Diff complete"
        );

        if self.dry_run {
            report.planned_downloads = diff.new_entries.iter().map(|e| e.path.clone()).collect();
            report.finished_at = Utc::now();
            info!(%run_id, planned = report.planned_downloads.len(), "Dry run finished");
            return Ok(report);
        }

        let outcomes: Vec<FileOutcome> = futures::stream::iter(diff.new_entries)
            .map(|entry| self.process_entry(entry))
            .buffer_unordered(self.workers)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                FileOutcome::Fetched => report.fetched += 1,
                FileOutcome::Directory => report.directories += 1,
                FileOutcome::Skipped => report.skipped += 1,
                FileOutcome::Failed(failure) => report.failures.push(failure),
            }
        }

        report.cancelled = self.cancel.is_cancelled();
        if let Some(router) = &self.router {
            if report.cancelled {
                info!(%run_id, "Run cancelled; skipping routing");
            } else {
                let routing = router.route_ready().await?;
                report.routed = routing.routed.len();
                report
                    .failures
                    .extend(routing.failures.iter().map(|f| FileFailure {
                        remote_identity: f.remote_identity.clone(),
                        stage: FailureStage::Routing,
                        message: f.message.clone(),
                    }));
                report.routing = Some(routing);
            }
        }

        report.errored = report.failures.len();
        report.finished_at = Utc::now();
        info!(
            %run_id,
            fetched = report.fetched,
            routed = report.routed,
            errored = report.errored,
            skipped = report.skipped,
            cancelled = report.cancelled,
            "Sync run finished"
        );
        Ok(report)
    }

    /// Download, hash, classify and persist one entry. The repository is
    /// written exactly once, after the last stage succeeds or definitively
    /// fails.
    async fn process_entry(&self, entry: RemoteEntry) -> FileOutcome {
        if self.cancel.is_cancelled() {
            return FileOutcome::Skipped;
        }
        if entry.is_dir {
            return self.track_directory(entry);
        }

        let local = match self.transfers.download(&entry).await {
            Ok(local) => local,
            Err(e) if e.is_retryable() && self.cancel.is_cancelled() => {
                debug!("Download of {} abandoned on cancellation", entry.path);
                return FileOutcome::Skipped;
            }
            Err(e) => {
                return self.record_failure(&entry, None, FailureStage::Download, e.to_string());
            }
        };

        let hash = match self.hasher.hash_file_async(&local.local_path).await {
            Ok(hash) => hash,
            Err(e) => {
                return self.record_failure(
                    &entry,
                    Some(&local.local_path),
                    FailureStage::Hash,
                    e.to_string(),
                );
            }
        };

        let classification = self.classifier.classify(&entry.name).await;
        let record = TrackedFile::from_entry(&entry)
            .with_local_path(&local.local_path)
            .with_hash(&hash)
            .with_classification(&classification)
            .with_provided_token(extract_provided_token(&entry.name));

        match self.repository.upsert_by_remote_identity(&record) {
            Ok(()) => {
                debug!(
                    remote = %entry.path,
                    hash = %hash.value,
                    show = %classification.show_name,
                    confidence = classification.confidence,
                    "Fetched"
                );
                FileOutcome::Fetched
            }
            Err(e) => {
                error!("Could not persist {}: {}", entry.path, e);
                FileOutcome::Failed(FileFailure {
                    remote_identity: entry.path,
                    stage: FailureStage::Persist,
                    message: e.to_string(),
                })
            }
        }
    }

    /// Record a directory row. Nothing is downloaded for it.
    fn track_directory(&self, entry: RemoteEntry) -> FileOutcome {
        match self.repository.upsert_by_remote_identity(&TrackedFile::from_entry(&entry)) {
            Ok(()) => {
                debug!(remote = %entry.path, "Tracked directory");
                FileOutcome::Directory
            }
            Err(e) => {
                error!("Could not persist {}: {}", entry.path, e);
                FileOutcome::Failed(FileFailure {
                    remote_identity: entry.path,
                    stage: FailureStage::Persist,
                    message: e.to_string(),
                })
            }
        }
    }

    /// Record every entry the remote currently offers as already handled,
    /// without downloading anything, so the next [`run`](Self::run) only
    /// fetches what appears afterwards.
    ///
    /// Entries are filtered exactly as in a run. Rows that already exist are
    /// left alone; new rows get status `deleted` with no local path.
    pub async fn bootstrap(&self) -> Result<BootstrapReport> {
        let listing = self
            .transfers
            .list(&self.remote_root, true)
            .await
            .map_err(|e| SyncError::RemoteUnavailable {
                message: e.to_string(),
            })?;
        let known = self.repository.known_identities()?;
        let diff = self.diff.diff(listing, &known);

        let mut report = BootstrapReport {
            dry_run: self.dry_run,
            listed: diff.listed,
            new_entries: diff.new_entries.len(),
            recorded: 0,
            entries: diff.new_entries.iter().map(|e| e.path.clone()).collect(),
        };
        if self.dry_run {
            info!(planned = report.new_entries, "Bootstrap dry run finished");
            return Ok(report);
        }

        for entry in &diff.new_entries {
            let mut record = TrackedFile::from_entry(entry)
                .with_provided_token(extract_provided_token(&entry.name));
            record.status = FileStatus::Deleted;
            self.repository.upsert_by_remote_identity(&record)?;
            report.recorded += 1;
        }
        info!(
            listed = report.listed,
            recorded = report.recorded,
            known = diff.already_known,
            "Bootstrap finished"
        );
        Ok(report)
    }

    fn record_failure(
        &self,
        entry: &RemoteEntry,
        local_path: Option<&Path>,
        stage: FailureStage,
        message: String,
    ) -> FileOutcome {
        warn!("{} failed at {}: {}", entry.path, stage, message);
        let record = TrackedFile::failed(entry, local_path, message.clone())
            .with_provided_token(extract_provided_token(&entry.name));

        let (stage, message) = match self.repository.upsert_by_remote_identity(&record) {
            Ok(()) => (stage, message),
            Err(e) => {
                error!("Could not record failure of {}: {}", entry.path, e);
                (FailureStage::Persist, format!("{} (not recorded: {})", message, e))
            }
        };

        FileOutcome::Failed(FileFailure {
            remote_identity: entry.path.clone(),
            stage,
            message,
        })
    }
}

/// Assembles a [`SyncPipeline`].
///
/// ```rust,ignore
/// let pipeline = SyncPipeline::builder(config, repository, source)
///     .classifier(classifier)
///     .registry(registry)
///     .cancellation(token)
///     .build()?;
/// let report = pipeline.run().await?;
/// ```
pub struct SyncPipelineBuilder {
    config: SyncConfig,
    repository: Arc<dyn LifecycleRepository>,
    source: Arc<dyn RemoteSource>,
    classifier: Option<Arc<FilenameClassifier>>,
    registry: Option<Arc<dyn MetadataRegistry>>,
    retry_policy: Option<RetryPolicy>,
    cancel: CancellationToken,
}

impl SyncPipelineBuilder {
    pub fn new(
        config: SyncConfig,
        repository: Arc<dyn LifecycleRepository>,
        source: Arc<dyn RemoteSource>,
    ) -> Self {
        Self {
            config,
            repository,
            source,
            classifier: None,
            registry: None,
            retry_policy: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Defaults to the deterministic tier only.
    pub fn classifier(mut self, classifier: Arc<FilenameClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Route fetched files through `registry` at the end of each run, unless
    /// routing is disabled in the configuration.
    pub fn registry(mut self, registry: Arc<dyn MetadataRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Override the retry policy derived from the transfer settings.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn build(self) -> Result<SyncPipeline> {
        let config = self.config;
        config.validate()?;

        let mut transfers =
            TransferPool::new(self.source, config.staging_dir.clone(), &config.transfer)
                .with_remote_root(config.remote_root.clone())
                .with_cancellation(self.cancel.clone());
        if let Some(policy) = self.retry_policy {
            transfers = transfers.with_policy(policy);
        }

        let router = self
            .registry
            .filter(|_| config.routing.enabled)
            .map(|registry| {
                Router::new(Arc::clone(&self.repository), registry)
                    .with_auto_register(config.routing.auto_register_shows)
                    .with_cancellation(self.cancel.clone())
            });

        Ok(SyncPipeline {
            repository: self.repository,
            workers: transfers.workers(),
            transfers,
            hasher: IntegrityHasher::from_settings(&config.hashing),
            classifier: self
                .classifier
                .unwrap_or_else(|| Arc::new(FilenameClassifier::deterministic())),
            diff: DiffEngine::from_settings(&config.filters, &config.remote_root),
            router,
            remote_root: config.remote_root,
            retry_failed_downloads: config.transfer.retry_failed_downloads,
            dry_run: config.dry_run,
            cancel: self.cancel,
        })
    }
}
