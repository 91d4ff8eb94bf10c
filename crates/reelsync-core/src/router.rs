//! Moves fetched files from staging into the show library.

use crate::cancel::CancellationToken;
use crate::error::{Result, SyncError};
use crate::models::{FileStatus, TrackedFile};
use crate::naming::{sanitize_component, season_directory};
use crate::registry::{MetadataRegistry, ShowRef};
use crate::repository::LifecycleRepository;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A completed move.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutedFile {
    pub remote_identity: String,
    pub from: PathBuf,
    pub to: PathBuf,
    pub show_id: String,
}

/// A move a dry run would have made.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutePlan {
    pub remote_identity: String,
    pub from: Option<PathBuf>,
    /// Unknown when the show would first have to be registered.
    pub to: Option<PathBuf>,
    pub show_name: String,
    pub would_register_show: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteFailure {
    pub remote_identity: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoutingReport {
    pub routed: Vec<RoutedFile>,
    pub planned: Vec<RoutePlan>,
    pub failures: Vec<RouteFailure>,
    /// Rows left alone: claimed elsewhere, or the run was cancelled.
    pub skipped: usize,
}

/// Where a row should go, before anything is touched.
struct Resolution {
    show: Option<ShowRef>,
    destination: Option<PathBuf>,
}

enum Outcome {
    Routed(RoutedFile),
    Planned(RoutePlan),
    Skipped,
}

/// Routes `fetched` rows into `<show dir>/Season NN/<file name>`.
pub struct Router {
    repository: Arc<dyn LifecycleRepository>,
    registry: Arc<dyn MetadataRegistry>,
    auto_register: bool,
    dry_run: bool,
    cancel: CancellationToken,
}

impl Router {
    pub fn new(
        repository: Arc<dyn LifecycleRepository>,
        registry: Arc<dyn MetadataRegistry>,
    ) -> Self {
        Self {
            repository,
            registry,
            auto_register: false,
            dry_run: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Register shows the registry does not know yet.
    pub fn with_auto_register(mut self, auto_register: bool) -> Self {
        self.auto_register = auto_register;
        self
    }

    /// Plan moves without touching the filesystem or the repository.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Route every file row currently in `fetched`. Per-row failures are
    /// recorded on the row and in the report; only a failed repository read
    /// is fatal. Directory rows are never routed.
    pub async fn route_ready(&self) -> Result<RoutingReport> {
        let rows: Vec<TrackedFile> = self
            .repository
            .list_by_status(FileStatus::Fetched)?
            .into_iter()
            .filter(|row| !row.is_dir)
            .collect();
        info!(
            "Routing {} fetched file(s){}",
            rows.len(),
            if self.dry_run { " (dry run)" } else { "" }
        );

        let mut report = RoutingReport::default();
        for row in rows {
            if self.cancel.is_cancelled() {
                report.skipped += 1;
                continue;
            }

            match self.route_row(&row).await {
                Ok(Outcome::Routed(routed)) => report.routed.push(routed),
                Ok(Outcome::Planned(plan)) => report.planned.push(plan),
                Ok(Outcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    let message = e.to_string();
                    warn!("Routing failed for {}: {}", row.remote_identity, message);
                    if !self.dry_run {
                        if let Err(mark_err) =
                            self.repository.mark_error(&row.remote_identity, &message)
                        {
                            error!(
                                "Could not record routing error for {}: {}",
                                row.remote_identity, mark_err
                            );
                        }
                    }
                    report.failures.push(RouteFailure {
                        remote_identity: row.remote_identity.clone(),
                        message,
                    });
                }
            }
        }

        info!(
            "Routing finished: {} routed, {} planned, {} failed, {} skipped",
            report.routed.len(),
            report.planned.len(),
            report.failures.len(),
            report.skipped
        );
        Ok(report)
    }

    async fn route_row(&self, row: &TrackedFile) -> Result<Outcome> {
        let id = row.remote_identity.as_str();
        let resolution = self.resolve(row).await?;

        if self.dry_run {
            let plan = RoutePlan {
                remote_identity: row.remote_identity.clone(),
                from: row.current_path.as_ref().map(PathBuf::from),
                to: resolution.destination,
                show_name: row.show_name.clone().unwrap_or_default(),
                would_register_show: resolution.show.is_none(),
            };
            debug!("Dry run: {} -> {:?}", id, plan.to);
            return Ok(Outcome::Planned(plan));
        }

        let (Some(show), Some(destination)) = (resolution.show, resolution.destination) else {
            return Err(SyncError::routing(id, "show could not be resolved"));
        };
        let source = row
            .current_path
            .as_deref()
            .map(PathBuf::from)
            .ok_or_else(|| SyncError::routing(id, "no local file to route"))?;

        if !self.repository.begin_processing(id)? {
            debug!("{} is no longer fetched; leaving it", id);
            return Ok(Outcome::Skipped);
        }
        // After the move, the location update must be the only write left.
        self.repository.record_show_match(id, &show.id)?;

        move_file(id, &source, &destination).await?;

        let destination_str = destination.to_string_lossy().into_owned();
        if let Err(e) = self
            .repository
            .transition_location(id, &destination_str, FileStatus::Routed)
        {
            // Put the file back so the row's current_path stays truthful.
            if let Err(undo) = move_file(id, &destination, &source).await {
                error!("Could not move {} back after failed update: {}", id, undo);
            }
            return Err(e);
        }

        info!("Routed {} -> {}", id, destination.display());
        Ok(Outcome::Routed(RoutedFile {
            remote_identity: row.remote_identity.clone(),
            from: source,
            to: destination,
            show_id: show.id,
        }))
    }

    async fn resolve(&self, row: &TrackedFile) -> Result<Resolution> {
        let id = row.remote_identity.as_str();
        let show_name = row
            .show_name
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| SyncError::routing(id, "no show name"))?;

        let show = match self.registry.find_show(show_name).await? {
            Some(show) => show,
            None if !self.auto_register => {
                return Err(SyncError::routing(
                    id,
                    format!("show '{}' not found in registry", show_name),
                ));
            }
            None if self.dry_run => {
                return Ok(Resolution {
                    show: None,
                    destination: None,
                });
            }
            None => self.registry.create_show(show_name, None).await?,
        };

        let episode = self
            .registry
            .resolve_episode(&show, row.season, row.episode)
            .await?;
        let season = match (episode, row.season, row.episode) {
            (Some(ep), _, _) => ep.season,
            (None, Some(season), Some(_)) => season,
            (None, None, Some(episode)) => {
                return Err(SyncError::routing(
                    id,
                    format!("cannot resolve absolute episode {} of '{}'", episode, show.name),
                ));
            }
            (None, _, None) => return Err(SyncError::routing(id, "no episode number")),
        };

        let destination = show
            .directory
            .join(season_directory(season))
            .join(sanitize_component(&row.name));

        Ok(Resolution {
            show: Some(show),
            destination: Some(destination),
        })
    }
}

/// Outcome of [`reset_failed_rows`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetrySummary {
    /// Error rows moved back to `fetched` for the next routing pass.
    pub reset: Vec<String>,
    /// Error rows with no hashed local file; only a new download can
    /// recover them.
    pub awaiting_download: Vec<String>,
}

/// Queue every `error` row that still has a hashed local file for another
/// routing attempt.
pub fn reset_failed_rows(repository: &dyn LifecycleRepository) -> Result<RetrySummary> {
    let mut summary = RetrySummary::default();
    for row in repository.list_by_status(FileStatus::Error)? {
        if row.current_path.is_none() || row.hash_value.is_none() {
            summary.awaiting_download.push(row.remote_identity);
            continue;
        }
        if repository.reset_for_retry(&row.remote_identity)? {
            summary.reset.push(row.remote_identity);
        }
    }
    info!(
        "Reset {} failed row(s); {} awaiting download",
        summary.reset.len(),
        summary.awaiting_download.len()
    );
    Ok(summary)
}

/// Move `from` to `to` without ever replacing an existing file. Falls back to
/// copy and remove when a rename is not possible.
async fn move_file(remote_identity: &str, from: &Path, to: &Path) -> Result<()> {
    if tokio::fs::try_exists(to).await.unwrap_or(false) {
        return Err(SyncError::routing(
            remote_identity,
            format!("destination already exists: {}", to.display()),
        ));
    }
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| SyncError::io_with_path(e, parent))?;
    }

    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            debug!(
                "Rename {} -> {} failed ({}), copying instead",
                from.display(),
                to.display(),
                rename_err
            );
            tokio::fs::copy(from, to)
                .await
                .map_err(|e| SyncError::io_with_path(e, from))?;
            tokio::fs::remove_file(from)
                .await
                .map_err(|e| SyncError::io_with_path(e, from))?;
            Ok(())
        }
    }
}
