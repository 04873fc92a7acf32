//! Core domain model and name matching rules for directory group / cohort reconciliation.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "cohortsync-core";

pub const DEFAULT_NAMESPACE_MARKER: &str = "ochin-crowd-";

/// Identifier of a local cohort record.
pub type CohortId = i64;

/// Group as reported by the external directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalGroup {
    pub id: String,
    #[serde(rename = "displayName", alias = "display_name")]
    pub display_name: String,
}

impl ExternalGroup {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Local group-like record (cohort).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalGroup {
    pub id: CohortId,
    pub name: String,
}

impl LocalGroup {
    pub fn new(id: CohortId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// Durable link between one external group and one cohort, unique on the pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Mapping {
    pub external_group_id: String,
    pub local_group_id: CohortId,
}

impl Mapping {
    pub fn new(external_group_id: impl Into<String>, local_group_id: CohortId) -> Self {
        Self {
            external_group_id: external_group_id.into(),
            local_group_id,
        }
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.external_group_id, self.local_group_id)
    }
}

/// Substring that marks the groups owned by this engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceMarker(String);

impl NamespaceMarker {
    pub fn new(marker: impl Into<String>) -> Self {
        Self(marker.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-sensitive substring test used to select candidate directory groups.
    pub fn matches(&self, name: &str) -> bool {
        name.contains(self.0.as_str())
    }

    /// Case-insensitive substring test used when scanning cohorts during drift detection.
    pub fn matches_ignore_case(&self, name: &str) -> bool {
        name.to_lowercase().contains(&self.0.to_lowercase())
    }
}

impl Default for NamespaceMarker {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE_MARKER)
    }
}

impl fmt::Display for NamespaceMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Directory groups inside the namespace, indexed by id.
///
/// The first occurrence wins when the directory reports the same id twice.
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    groups: Vec<ExternalGroup>,
    by_id: HashMap<String, usize>,
}

impl CandidateSet {
    pub fn filter<I>(groups: I, marker: &NamespaceMarker) -> Self
    where
        I: IntoIterator<Item = ExternalGroup>,
    {
        let mut set = Self::default();
        for group in groups {
            if !marker.matches(&group.display_name) {
                continue;
            }
            if let Entry::Vacant(slot) = set.by_id.entry(group.id.clone()) {
                slot.insert(set.groups.len());
                set.groups.push(group);
            }
        }
        set
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn contains(&self, external_group_id: &str) -> bool {
        self.by_id.contains_key(external_group_id)
    }

    pub fn get(&self, external_group_id: &str) -> Option<&ExternalGroup> {
        self.by_id
            .get(external_group_id)
            .map(|&idx| &self.groups[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExternalGroup> {
        self.groups.iter()
    }
}

/// Pairs every cohort with every candidate whose display name is exactly equal to the cohort name.
pub fn bootstrap_pairs(
    cohorts: &BTreeMap<CohortId, LocalGroup>,
    candidates: &CandidateSet,
) -> Vec<Mapping> {
    let mut pairs = Vec::new();
    for cohort in cohorts.values() {
        for group in candidates.iter() {
            if group.display_name == cohort.name {
                pairs.push(Mapping::new(group.id.clone(), cohort.id));
            }
        }
    }
    pairs
}

/// Candidates with no case-insensitive name match among the namespace cohorts.
pub fn find_new_groups<'a>(
    cohorts: &BTreeMap<CohortId, LocalGroup>,
    candidates: &'a CandidateSet,
    marker: &NamespaceMarker,
) -> Vec<&'a ExternalGroup> {
    let known: Vec<String> = cohorts
        .values()
        .filter(|cohort| marker.matches_ignore_case(&cohort.name))
        .map(|cohort| cohort.name.to_lowercase())
        .collect();

    candidates
        .iter()
        .filter(|group| {
            let wanted = group.display_name.to_lowercase();
            !known.iter().any(|name| *name == wanted)
        })
        .collect()
}
