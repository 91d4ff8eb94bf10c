//! Reelsync - mirror new media from a remote directory into a local library.
//!
//! Reports are printed to stdout as JSON; logs go to stderr.

mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reelsync_core::repository::FileQuery;
use reelsync_core::{
    create_semantic_classifier, reset_failed_rows, CancellationToken, DirectoryRegistry,
    FileStatus, FilenameClassifier, LifecycleRepository, LocalDirSource, Router,
    SqliteRepository, SyncConfig, SyncPipeline,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "reelsync")]
#[command(about = "Sync new media from a remote directory into a show library")]
struct Args {
    /// JSON configuration file (defaults to <config dir>/reelsync/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List, download, classify and route new remote files
    Sync {
        /// Directory the remote root is read from
        #[arg(long)]
        source_dir: PathBuf,

        /// Plan only; download, move and record nothing
        #[arg(long)]
        dry_run: bool,

        /// Leave fetched files in staging
        #[arg(long)]
        no_route: bool,
    },
    /// Record everything currently on the remote as known without
    /// downloading it, so later syncs only fetch what appears afterwards
    Bootstrap {
        /// Directory the remote root is read from
        #[arg(long)]
        source_dir: PathBuf,

        /// Report what would be recorded
        #[arg(long)]
        dry_run: bool,
    },
    /// Route files already fetched into staging
    Route {
        #[arg(long)]
        dry_run: bool,
    },
    /// Show row counts and recent errors
    Status,
    /// Queue failed rows for another routing attempt
    RetryErrors,
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("reelsync").join("config.json"))
}

fn load_config(explicit: Option<&PathBuf>) -> Result<SyncConfig> {
    if let Some(path) = explicit {
        return SyncConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()));
    }
    match default_config_path().filter(|p| p.is_file()) {
        Some(path) => {
            info!("Using configuration {}", path.display());
            SyncConfig::from_json_file(&path)
                .with_context(|| format!("loading {}", path.display()))
        }
        None => {
            info!("No configuration file found; using defaults");
            Ok(SyncConfig::default())
        }
    }
}

fn open_repository(config: &SyncConfig) -> Result<Arc<SqliteRepository>> {
    let repository = SqliteRepository::open(&config.database_path)
        .with_context(|| format!("opening {}", config.database_path.display()))?;
    Ok(Arc::new(repository))
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight files");
            token.cancel();
        }
    });
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.debug, args.json_logs);

    let mut config = load_config(args.config.as_ref())?;

    match args.command {
        Command::Sync {
            source_dir,
            dry_run,
            no_route,
        } => {
            config.dry_run |= dry_run;
            if no_route {
                config.routing.enabled = false;
            }

            let repository = open_repository(&config)?;
            let semantic = create_semantic_classifier(&config.classifier)?;
            let classifier = Arc::new(FilenameClassifier::new(semantic, &config.classifier));
            let registry = Arc::new(DirectoryRegistry::new(&config.library_dir));
            let token = CancellationToken::new();
            cancel_on_ctrl_c(token.clone());

            let pipeline =
                SyncPipeline::builder(config, repository, Arc::new(LocalDirSource::new(source_dir)))
                    .classifier(classifier)
                    .registry(registry)
                    .cancellation(token)
                    .build()?;
            let report = pipeline.run().await?;
            print_json(&report)?;
            if report.errored > 0 {
                warn!("{} file(s) failed; see the report for details", report.errored);
            }
        }
        Command::Bootstrap {
            source_dir,
            dry_run,
        } => {
            config.dry_run |= dry_run;
            let repository = open_repository(&config)?;
            let pipeline =
                SyncPipeline::builder(config, repository, Arc::new(LocalDirSource::new(source_dir)))
                    .build()?;
            let report = pipeline.bootstrap().await?;
            info!(
                "Bootstrap recorded {} of {} new entries",
                report.recorded, report.new_entries
            );
            print_json(&report)?;
        }
        Command::Route { dry_run } => {
            let repository = open_repository(&config)?;
            let token = CancellationToken::new();
            cancel_on_ctrl_c(token.clone());

            let router = Router::new(
                repository,
                Arc::new(DirectoryRegistry::new(&config.library_dir)),
            )
            .with_auto_register(config.routing.auto_register_shows)
            .with_dry_run(dry_run || config.dry_run)
            .with_cancellation(token);
            print_json(&router.route_ready().await?)?;
        }
        Command::Status => {
            let repository = open_repository(&config)?;
            let counts = repository.status_counts()?;
            let errors = repository.list(
                &FileQuery::default()
                    .with_status(FileStatus::Error)
                    .page(20, 0),
            )?;
            let recent_errors: Vec<_> = errors
                .items
                .iter()
                .map(|row| {
                    json!({
                        "remote_identity": row.remote_identity,
                        "error": row.error_message,
                        "local_path": row.current_path,
                    })
                })
                .collect();
            print_json(&json!({
                "counts": counts,
                "total": counts.total(),
                "errors_shown": recent_errors.len(),
                "errors_total": errors.total_count,
                "recent_errors": recent_errors,
            }))?;
        }
        Command::RetryErrors => {
            let repository = open_repository(&config)?;
            print_json(&reset_failed_rows(repository.as_ref())?)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_flags() {
        let args = Args::try_parse_from([
            "reelsync",
            "--debug",
            "sync",
            "--source-dir",
            "/mnt/box",
            "--dry-run",
            "--no-route",
        ])
        .unwrap();
        assert!(args.debug);
        match args.command {
            Command::Sync {
                source_dir,
                dry_run,
                no_route,
            } => {
                assert_eq!(source_dir, PathBuf::from("/mnt/box"));
                assert!(dry_run);
                assert!(no_route);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args =
            Args::try_parse_from(["reelsync", "status", "--config", "c.json", "--json-logs"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("c.json")));
        assert!(args.json_logs);
        assert!(matches!(args.command, Command::Status));
    }

    #[test]
    fn test_bootstrap_flags() {
        let args =
            Args::try_parse_from(["reelsync", "bootstrap", "--source-dir", "/mnt/box", "--dry-run"])
                .unwrap();
        match args.command {
            Command::Bootstrap {
                source_dir,
                dry_run,
            } => {
                assert_eq!(source_dir, PathBuf::from("/mnt/box"));
                assert!(dry_run);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_sync_requires_source_dir() {
        assert!(Args::try_parse_from(["reelsync", "sync"]).is_err());
    }
}
