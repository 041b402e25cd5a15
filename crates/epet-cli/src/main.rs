use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use epet_core::RecordKind;
use epet_sync::{DatasetKind, HarvestConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "epet")]
#[command(about = "Incremental harvester for e-petition comments and signers")]
struct Cli {
    /// YAML config file; EPET_* environment variables still override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect records created since the last run into a staged CSV.
    Harvest {
        kind: RecordKind,
        /// File name inside the staging directory.
        #[arg(long)]
        output: Option<String>,
    },
    /// Load staged artifacts into the database.
    Load {
        dataset: DatasetKind,
        /// Load this artifact instead of every pending one. A signers artifact
        /// older than one already loaded is skipped and kept.
        #[arg(long)]
        file: Option<PathBuf>,
        /// Load into an in-memory store and keep the artifacts.
        #[arg(long)]
        dry_run: bool,
    },
    /// Stage a full snapshot of every petition's details.
    Petitions,
    Migrate,
    /// Run harvest and load on the configured cron schedule.
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("EPET_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<HarvestConfig> {
    match path {
        Some(path) => Ok(HarvestConfig::from_yaml_file(path)?
            .with_overrides(|key| std::env::var(key).ok())),
        None => HarvestConfig::from_env(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Harvest { kind, output } => {
            tokio::select! {
                result = epet_sync::run_harvest(&config, kind, output) => {
                    let summary = result?;
                    println!(
                        "harvest complete: run_id={} kind={} parents={} records={} skipped={} artifact={}",
                        summary.run_id,
                        summary.kind,
                        summary.parents,
                        summary.records,
                        summary.skipped.len(),
                        summary.artifact.path.display()
                    );
                }
                _ = tokio::signal::ctrl_c() => {
                    warn!(kind = %kind, "interrupted, staged output discarded and watermark unchanged");
                    bail!("harvest of {kind} interrupted");
                }
            }
        }
        Commands::Load {
            dataset,
            file,
            dry_run,
        } => {
            let reports = if dry_run {
                epet_sync::run_load_dry(&config, dataset, file.as_deref()).await?
            } else {
                epet_sync::run_load(&config, dataset, file.as_deref()).await?
            };
            for report in &reports {
                println!(
                    "load {}: source={} rows={} inserted={} already_present={} batch_skipped={}{}",
                    report.dataset,
                    report
                        .source
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default(),
                    report.rows,
                    report.inserted,
                    report.already_present,
                    report.batch_skipped,
                    if dry_run { " (dry run)" } else { "" }
                );
            }
            if reports.is_empty() {
                info!(dataset = %dataset, dir = %config.staging_dir.display(), "nothing to load");
            }
        }
        Commands::Petitions => {
            let summary = epet_sync::run_petition_snapshot(&config).await?;
            println!(
                "petition snapshot complete: run_id={} petitions={} artifact={}",
                summary.run_id,
                summary.petitions,
                summary.artifact.path.display()
            );
        }
        Commands::Migrate => {
            epet_sync::run_migrations(&config).await?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let Some(mut sched) = epet_sync::maybe_build_scheduler(&config).await? else {
                bail!("scheduler disabled; set EPET_SCHEDULER_ENABLED=true or scheduler_enabled in the config file");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.harvest_cron, "scheduler running, ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
