//! Reconciliation run orchestration: engine, configuration, run reports and scheduling.

use std::sync::Arc;

use anyhow::{Context, Result};
use cohortsync_adapters::{
    FixtureGroupDirectory, GraphDirectoryConfig, GraphGroupDirectory, GroupDirectory,
    LoggingMembershipSynchronizer,
};
use cohortsync_storage::{connect, GroupCache, HttpFetcher, PgCohortStore, PgMappingStore};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

mod config;
mod engine;
mod report;

pub use config::{SyncConfig, DEFAULT_CONFIG_PATH};
pub use engine::ReconciliationEngine;
pub use report::{
    render_brief, write_run_report, PruneReason, RunCounts, RunEvent, RunOutcome, RunReport,
    RunState,
};

pub const CRATE_NAME: &str = "cohortsync-sync";

/// Builds the directory client the configuration describes, if any.
///
/// A groups fixture takes precedence over Graph. Without either, the engine has no client.
pub fn directory_from_config(config: &SyncConfig) -> Result<Option<Arc<dyn GroupDirectory>>> {
    let cache = GroupCache::persistent(config.group_cache_path());

    if let Some(fixture) = &config.groups_fixture {
        let directory = FixtureGroupDirectory::new(fixture.clone()).with_cache(cache);
        return Ok(Some(Arc::new(directory)));
    }

    let Some(token) = &config.graph_access_token else {
        return Ok(None);
    };
    let http =
        HttpFetcher::new(config.http_client_config()).context("building directory http client")?;
    let graph = GraphDirectoryConfig::new(token.clone()).with_base_url(config.graph_base_url.clone());
    Ok(Some(Arc::new(GraphGroupDirectory::new(
        graph,
        Arc::new(http),
        cache,
    ))))
}

pub async fn engine_from_config(config: &SyncConfig) -> Result<ReconciliationEngine> {
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is not set")?;
    let pool = connect(database_url)
        .await
        .context("connecting to the cohort database")?;

    Ok(ReconciliationEngine::new(
        directory_from_config(config)?,
        Arc::new(PgCohortStore::new(pool.clone())),
        Arc::new(PgMappingStore::new(pool)),
        Arc::new(LoggingMembershipSynchronizer),
        config.namespace(),
    ))
}

/// Runs the engine once, writing the run report when a reports directory is configured.
pub async fn run_and_report(engine: &ReconciliationEngine, config: &SyncConfig) -> RunReport {
    let report = engine.run_once().await;
    if let Some(dir) = &config.reports_dir {
        match write_run_report(dir, &report).await {
            Ok(path) => info!(path = %path.display(), "wrote run report"),
            Err(err) => warn!(error = %err, "failed to write run report"),
        }
    }
    report
}

/// Cron-triggered runs. Returns `None` when the scheduler is disabled.
pub async fn maybe_build_scheduler(
    engine: Arc<ReconciliationEngine>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job_config = Arc::new(config.clone());
    let job = Job::new_async(config.sync_cron.as_str(), move |_uuid, _l| {
        let engine = engine.clone();
        let config = job_config.clone();
        Box::pin(async move {
            let report = run_and_report(&engine, &config).await;
            info!(run_id = %report.run_id, outcome = ?report.outcome, "scheduled sync finished");
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.sync_cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
