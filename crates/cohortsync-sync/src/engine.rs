use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use cohortsync_adapters::{GroupDirectory, MembershipSynchronizer};
use cohortsync_core::{
    bootstrap_pairs, find_new_groups, CandidateSet, CohortId, LocalGroup, Mapping,
    NamespaceMarker,
};
use cohortsync_storage::{CohortStore, MappingStore};
use tokio::sync::Mutex;
use tracing::{info_span, Instrument};

use crate::report::{PruneReason, RunEvent, RunOutcome, RunRecorder, RunReport, RunState};

/// Reconciles directory groups with cohorts through the mapping table, then syncs membership.
pub struct ReconciliationEngine {
    directory: Option<Arc<dyn GroupDirectory>>,
    cohorts: Arc<dyn CohortStore>,
    mappings: Arc<dyn MappingStore>,
    members: Arc<dyn MembershipSynchronizer>,
    marker: NamespaceMarker,
    run_lock: Mutex<()>,
}

impl ReconciliationEngine {
    /// `directory` is `None` when no usable directory client could be built; runs then do nothing.
    pub fn new(
        directory: Option<Arc<dyn GroupDirectory>>,
        cohorts: Arc<dyn CohortStore>,
        mappings: Arc<dyn MappingStore>,
        members: Arc<dyn MembershipSynchronizer>,
        marker: NamespaceMarker,
    ) -> Self {
        Self {
            directory,
            cohorts,
            mappings,
            members,
            marker,
            run_lock: Mutex::new(()),
        }
    }

    pub fn namespace(&self) -> &NamespaceMarker {
        &self.marker
    }

    /// Runs one reconciliation pass. Overlapping calls wait for the previous pass to finish.
    ///
    /// Never fails: setup problems end the run early with an aborted outcome, per-item
    /// failures are recorded and skipped.
    pub async fn run_once(&self) -> RunReport {
        let _guard = self.run_lock.lock().await;
        let mut run = RunRecorder::start(self.marker.as_str());
        let span = info_span!("cohort_sync_run", run_id = %run.run_id());
        let outcome = self.execute(&mut run).instrument(span).await;
        run.finish(outcome)
    }

    async fn execute(&self, run: &mut RunRecorder) -> RunOutcome {
        let Some(directory) = &self.directory else {
            run.abort(
                RunState::AbortedNoClient,
                RunOutcome::NoClient,
                RunEvent::NoDirectoryClient,
            );
            return RunOutcome::NoClient;
        };

        match directory.refresh_cache().await {
            Ok(refresh) => run.record(RunEvent::CacheRefreshed {
                groups: refresh.group_count,
                changed: refresh.changed,
            }),
            Err(err) => {
                run.abort(
                    RunState::AbortedCacheFailure,
                    RunOutcome::CacheRefreshFailed,
                    RunEvent::CacheRefreshFailed {
                        error: err.to_string(),
                    },
                );
                return RunOutcome::CacheRefreshFailed;
            }
        }
        run.enter(RunState::CacheRefreshed);

        let groups = directory.list_groups().await;
        run.counts().directory_groups = groups.len();
        let candidates = CandidateSet::filter(groups, &self.marker);
        run.counts().candidates = candidates.len();
        run.record(RunEvent::CandidatesFound {
            count: candidates.len(),
        });

        let Some((mappings, cohorts)) = self.load_snapshot(run).await else {
            return RunOutcome::SnapshotFailed;
        };

        if mappings.is_empty() && !candidates.is_empty() {
            run.enter(RunState::Bootstrap);
            self.bootstrap(run, &cohorts, &candidates).await;
            run.enter(RunState::Done);
            return RunOutcome::Bootstrapped;
        }

        if !mappings.is_empty() && mappings.len() != candidates.len() {
            run.enter(RunState::Diff);
            self.add_new_groups(run, &cohorts, &candidates).await;
        }

        let surviving = self.prune(run, &mappings, &candidates, &cohorts).await;
        run.enter(RunState::Pruned);

        self.sync_members(run, &surviving).await;
        run.enter(RunState::MembersSynced);
        run.enter(RunState::Done);
        RunOutcome::Completed
    }

    async fn load_snapshot(
        &self,
        run: &mut RunRecorder,
    ) -> Option<(Vec<Mapping>, BTreeMap<CohortId, LocalGroup>)> {
        let mappings = match self.mappings.list_mappings().await {
            Ok(rows) => rows,
            Err(err) => {
                run.abort(
                    RunState::AbortedSnapshotFailure,
                    RunOutcome::SnapshotFailed,
                    RunEvent::SnapshotFailed {
                        source: "mappings".to_string(),
                        error: err.to_string(),
                    },
                );
                return None;
            }
        };
        let cohorts = match self.cohorts.list_cohorts().await {
            Ok(rows) => rows,
            Err(err) => {
                run.abort(
                    RunState::AbortedSnapshotFailure,
                    RunOutcome::SnapshotFailed,
                    RunEvent::SnapshotFailed {
                        source: "cohorts".to_string(),
                        error: err.to_string(),
                    },
                );
                return None;
            }
        };

        run.counts().mappings_loaded = mappings.len();
        run.counts().cohorts = cohorts.len();
        run.record(RunEvent::SnapshotLoaded {
            mappings: mappings.len(),
            cohorts: cohorts.len(),
        });
        Some((mappings, cohorts))
    }

    async fn bootstrap(
        &self,
        run: &mut RunRecorder,
        cohorts: &BTreeMap<CohortId, LocalGroup>,
        candidates: &CandidateSet,
    ) {
        run.record(RunEvent::BootstrapStarted);
        for mapping in bootstrap_pairs(cohorts, candidates) {
            let name = cohorts
                .get(&mapping.local_group_id)
                .map(|cohort| cohort.name.clone())
                .unwrap_or_default();
            run.record(RunEvent::BootstrapMatched {
                mapping: mapping.clone(),
                name,
            });
            self.link(run, mapping).await;
        }
    }

    /// Creates a cohort and a mapping for every candidate with no case-insensitive cohort match.
    async fn add_new_groups(
        &self,
        run: &mut RunRecorder,
        cohorts: &BTreeMap<CohortId, LocalGroup>,
        candidates: &CandidateSet,
    ) {
        let new_groups = find_new_groups(cohorts, candidates, &self.marker);
        run.record(RunEvent::NewGroupsFound {
            count: new_groups.len(),
        });

        for group in new_groups {
            run.record(RunEvent::NewGroupFound {
                external_group_id: group.id.clone(),
                name: group.display_name.clone(),
            });

            let local_group_id = match self.cohorts.create_cohort(&group.display_name).await {
                Ok(id) => id,
                Err(err) => {
                    run.counts().cohort_failures += 1;
                    run.record(RunEvent::CohortCreateFailed {
                        name: group.display_name.clone(),
                        error: err.to_string(),
                    });
                    continue;
                }
            };
            run.counts().cohorts_created += 1;
            run.record(RunEvent::CohortCreated {
                local_group_id,
                name: group.display_name.clone(),
            });

            self.link(run, Mapping::new(group.id.clone(), local_group_id))
                .await;
        }
    }

    async fn link(&self, run: &mut RunRecorder, mapping: Mapping) {
        match self
            .mappings
            .add_mapping(&mapping.external_group_id, mapping.local_group_id)
            .await
        {
            Ok(true) => {
                run.counts().mappings_created += 1;
                run.record(RunEvent::MappingCreated { mapping });
            }
            Ok(false) => run.record(RunEvent::MappingAlreadyPresent { mapping }),
            Err(err) => {
                run.counts().mapping_failures += 1;
                run.record(RunEvent::MappingCreateFailed {
                    mapping,
                    error: err.to_string(),
                });
            }
        }
    }

    /// Deletes mappings whose group or cohort is gone and returns the rest, one entry per pair.
    async fn prune(
        &self,
        run: &mut RunRecorder,
        mappings: &[Mapping],
        candidates: &CandidateSet,
        cohorts: &BTreeMap<CohortId, LocalGroup>,
    ) -> Vec<Mapping> {
        let snapshot: BTreeSet<&Mapping> = mappings.iter().collect();
        run.record(RunEvent::MappingsChecked {
            count: snapshot.len(),
        });

        let mut surviving = Vec::with_capacity(snapshot.len());
        for mapping in snapshot {
            let reason = if !candidates.contains(&mapping.external_group_id) {
                PruneReason::ExternalGroupMissing
            } else if !cohorts.contains_key(&mapping.local_group_id) {
                PruneReason::CohortMissing
            } else {
                surviving.push(mapping.clone());
                continue;
            };

            match self
                .mappings
                .delete_mapping(&mapping.external_group_id, mapping.local_group_id)
                .await
            {
                Ok(removed) => {
                    run.counts().mappings_pruned += 1;
                    run.record(RunEvent::MappingPruned {
                        mapping: mapping.clone(),
                        reason,
                        removed,
                    });
                }
                Err(err) => {
                    run.counts().prune_failures += 1;
                    run.record(RunEvent::MappingPruneFailed {
                        mapping: mapping.clone(),
                        reason,
                        error: err.to_string(),
                    });
                }
            }
        }
        surviving
    }

    async fn sync_members(&self, run: &mut RunRecorder, mappings: &[Mapping]) {
        for mapping in mappings {
            match self
                .members
                .sync_members(&mapping.external_group_id, mapping.local_group_id)
                .await
            {
                Ok(()) => {
                    run.counts().members_synced += 1;
                    run.record(RunEvent::MembersSynced {
                        mapping: mapping.clone(),
                    });
                }
                Err(err) => {
                    run.counts().member_sync_failures += 1;
                    run.record(RunEvent::MembersSyncFailed {
                        mapping: mapping.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }
    }
}
