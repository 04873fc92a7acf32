use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cohortsync_core::{CohortId, Mapping};
use serde::Serialize;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

/// States of one reconciliation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    CacheRefreshed,
    Bootstrap,
    Diff,
    Pruned,
    MembersSynced,
    Done,
    AbortedNoClient,
    AbortedCacheFailure,
    AbortedSnapshotFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Pruning and membership sync ran.
    Completed,
    /// Only the initial name matching ran; the next run syncs members.
    Bootstrapped,
    NoClient,
    CacheRefreshFailed,
    SnapshotFailed,
}

impl RunOutcome {
    pub fn did_work(self) -> bool {
        matches!(self, RunOutcome::Completed | RunOutcome::Bootstrapped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneReason {
    ExternalGroupMissing,
    CohortMissing,
}

/// One decision taken during a run, in the order it was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    NoDirectoryClient,
    CacheRefreshFailed {
        error: String,
    },
    CacheRefreshed {
        groups: usize,
        changed: bool,
    },
    CandidatesFound {
        count: usize,
    },
    SnapshotFailed {
        source: String,
        error: String,
    },
    SnapshotLoaded {
        mappings: usize,
        cohorts: usize,
    },
    BootstrapStarted,
    BootstrapMatched {
        mapping: Mapping,
        name: String,
    },
    MappingCreated {
        mapping: Mapping,
    },
    MappingAlreadyPresent {
        mapping: Mapping,
    },
    MappingCreateFailed {
        mapping: Mapping,
        error: String,
    },
    NewGroupsFound {
        count: usize,
    },
    NewGroupFound {
        external_group_id: String,
        name: String,
    },
    CohortCreated {
        local_group_id: CohortId,
        name: String,
    },
    CohortCreateFailed {
        name: String,
        error: String,
    },
    MappingsChecked {
        count: usize,
    },
    MappingPruned {
        mapping: Mapping,
        reason: PruneReason,
        removed: bool,
    },
    MappingPruneFailed {
        mapping: Mapping,
        reason: PruneReason,
        error: String,
    },
    MembersSynced {
        mapping: Mapping,
    },
    MembersSyncFailed {
        mapping: Mapping,
        error: String,
    },
}

impl RunEvent {
    fn log(&self) {
        match self {
            RunEvent::NoDirectoryClient => warn!("no directory client available; nothing to do"),
            RunEvent::CacheRefreshFailed { error } => {
                warn!(%error, "failed to refresh directory group cache; exiting")
            }
            RunEvent::CacheRefreshed { groups, changed } => {
                info!(groups, changed, "directory group cache refreshed")
            }
            RunEvent::CandidatesFound { count } => info!(count, "found namespace groups"),
            RunEvent::SnapshotFailed { source, error } => {
                warn!(source = %source, %error, "failed to load snapshot; exiting")
            }
            RunEvent::SnapshotLoaded { mappings, cohorts } => {
                info!(mappings, cohorts, "loaded mappings and cohorts")
            }
            RunEvent::BootstrapStarted => {
                info!("no mappings found; matching existing cohorts by name")
            }
            RunEvent::BootstrapMatched { mapping, name } => {
                info!(%mapping, name = %name, "found matching group")
            }
            RunEvent::MappingCreated { mapping } => info!(%mapping, "group mapped"),
            RunEvent::MappingAlreadyPresent { mapping } => info!(%mapping, "mapping already present"),
            RunEvent::MappingCreateFailed { mapping, error } => {
                warn!(%mapping, %error, "error mapping group")
            }
            RunEvent::NewGroupsFound { count } => info!(count, "found new groups"),
            RunEvent::NewGroupFound {
                external_group_id,
                name,
            } => info!(external_group_id = %external_group_id, name = %name, "found new group"),
            RunEvent::CohortCreated {
                local_group_id,
                name,
            } => info!(local_group_id, name = %name, "added new cohort"),
            RunEvent::CohortCreateFailed { name, error } => {
                warn!(name = %name, %error, "failed to add cohort")
            }
            RunEvent::MappingsChecked { count } => info!(count, "checking mappings"),
            RunEvent::MappingPruned {
                mapping, reason, ..
            } => match reason {
                PruneReason::ExternalGroupMissing => {
                    info!(%mapping, "deleted mapping for non-existing group")
                }
                PruneReason::CohortMissing => {
                    info!(%mapping, "deleted mapping for non-existing cohort")
                }
            },
            RunEvent::MappingPruneFailed {
                mapping,
                reason,
                error,
            } => warn!(%mapping, ?reason, %error, "failed to delete stale mapping"),
            RunEvent::MembersSynced { mapping } => info!(%mapping, "processed mapping"),
            RunEvent::MembersSyncFailed { mapping, error } => {
                warn!(%mapping, %error, "membership sync failed")
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub directory_groups: usize,
    pub candidates: usize,
    pub cohorts: usize,
    pub mappings_loaded: usize,
    pub mappings_created: usize,
    pub mapping_failures: usize,
    pub cohorts_created: usize,
    pub cohort_failures: usize,
    pub mappings_pruned: usize,
    pub prune_failures: usize,
    pub members_synced: usize,
    pub member_sync_failures: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub namespace_marker: String,
    pub outcome: RunOutcome,
    pub states: Vec<RunState>,
    pub counts: RunCounts,
    pub events: Vec<RunEvent>,
}

impl RunReport {
    pub fn final_state(&self) -> RunState {
        self.states.last().copied().unwrap_or(RunState::Init)
    }

    pub fn visited(&self, state: RunState) -> bool {
        self.states.contains(&state)
    }
}

/// Accumulates a report while a run is in progress.
#[derive(Debug)]
pub(crate) struct RunRecorder {
    report: RunReport,
}

impl RunRecorder {
    pub(crate) fn start(namespace_marker: &str) -> Self {
        let now = Utc::now();
        Self {
            report: RunReport {
                run_id: Uuid::new_v4(),
                started_at: now,
                finished_at: now,
                namespace_marker: namespace_marker.to_string(),
                outcome: RunOutcome::Completed,
                states: vec![RunState::Init],
                counts: RunCounts::default(),
                events: Vec::new(),
            },
        }
    }

    pub(crate) fn run_id(&self) -> Uuid {
        self.report.run_id
    }

    pub(crate) fn enter(&mut self, state: RunState) {
        self.report.states.push(state);
    }

    pub(crate) fn record(&mut self, event: RunEvent) {
        event.log();
        self.report.events.push(event);
    }

    pub(crate) fn counts(&mut self) -> &mut RunCounts {
        &mut self.report.counts
    }

    pub(crate) fn abort(&mut self, state: RunState, outcome: RunOutcome, event: RunEvent) {
        self.record(event);
        self.enter(state);
        self.report.outcome = outcome;
    }

    pub(crate) fn finish(mut self, outcome: RunOutcome) -> RunReport {
        if self.report.outcome.did_work() {
            self.report.outcome = outcome;
        }
        self.report.finished_at = Utc::now();
        self.report
    }
}

/// Writes `run_report.json` and `run_brief.md` under `<reports_dir>/<run_id>/`.
pub async fn write_run_report(reports_dir: &Path, report: &RunReport) -> Result<PathBuf> {
    let run_dir = reports_dir.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(run_dir.join("run_report.json"), json)
        .await
        .context("writing run_report.json")?;

    fs::write(run_dir.join("run_brief.md"), render_brief(report))
        .await
        .context("writing run_brief.md")?;

    Ok(run_dir)
}

pub fn render_brief(report: &RunReport) -> String {
    let c = &report.counts;
    format!(
        "# Cohort Sync Run\n\n\
         - Run ID: `{}`\n\
         - Started: {}\n\
         - Finished: {}\n\
         - Namespace: `{}`\n\
         - Outcome: {:?}\n\n\
         ## Counts\n\
         - directory groups: {}\n\
         - candidates: {}\n\
         - cohorts: {}\n\
         - mappings loaded: {}\n\
         - mappings created: {} ({} failed)\n\
         - cohorts created: {} ({} failed)\n\
         - mappings pruned: {} ({} failed)\n\
         - memberships synced: {} ({} failed)\n",
        report.run_id,
        report.started_at,
        report.finished_at,
        report.namespace_marker,
        report.outcome,
        c.directory_groups,
        c.candidates,
        c.cohorts,
        c.mappings_loaded,
        c.mappings_created,
        c.mapping_failures,
        c.cohorts_created,
        c.cohort_failures,
        c.mappings_pruned,
        c.prune_failures,
        c.members_synced,
        c.member_sync_failures,
    )
}
