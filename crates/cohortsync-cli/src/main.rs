use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cohortsync_sync::{
    engine_from_config, maybe_build_scheduler, run_and_report, SyncConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cohortsync")]
#[command(about = "Reconcile directory groups with local cohorts")]
struct Cli {
    /// YAML configuration file; defaults to ./cohortsync.yaml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Namespace marker selecting the groups this tool manages.
    #[arg(long, global = true)]
    namespace: Option<String>,

    /// Read directory groups from a JSON file instead of Microsoft Graph.
    #[arg(long, global = true)]
    groups_fixture: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass.
    Sync,
    /// Apply database migrations.
    Migrate,
    /// Run reconciliation on the configured cron schedule until interrupted.
    Schedule,
}

impl Cli {
    fn load_config(&self) -> Result<SyncConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let mut config = SyncConfig::from_yaml_file(path)?;
                config.apply_env(|key| std::env::var(key).ok());
                config
            }
            None => SyncConfig::from_env()?,
        };
        if let Some(namespace) = &self.namespace {
            config.namespace_marker = namespace.clone();
        }
        if let Some(fixture) = &self.groups_fixture {
            config.groups_fixture = Some(fixture.clone());
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.load_config()?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let engine = engine_from_config(&config).await?;
            let report = run_and_report(&engine, &config).await;
            let c = &report.counts;
            println!(
                "sync {:?}: run_id={} candidates={} cohorts_created={} mappings_created={} pruned={} synced={}",
                report.outcome,
                report.run_id,
                c.candidates,
                c.cohorts_created,
                c.mappings_created,
                c.mappings_pruned,
                c.members_synced
            );
        }
        Commands::Migrate => {
            let database_url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is not set")?;
            let pool = cohortsync_storage::connect(database_url).await?;
            cohortsync_storage::run_migrations(&pool).await?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..config
            };
            let engine = Arc::new(engine_from_config(&config).await?);
            let Some(mut sched) = maybe_build_scheduler(engine, &config).await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
