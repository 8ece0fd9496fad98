//! Sponsor Early-Stop Aggregation
//!
//! Filters normalized trials to the interventional phase 2/3 cohort, groups
//! them by sponsor class and computes early-stop over closed ratios.
//!
//! Rows come out sorted by sponsor class so repeated runs over the same batch
//! serialize to identical bytes.

use crate::models::{NormalizedTrial, SponsorMetric, UNKNOWN_SPONSOR_CLASS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Cohort selection criteria.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortFilter {
    /// Exact, case-sensitive study type designation.
    #[serde(default = "default_study_type")]
    pub study_type: String,

    /// Lower-case needles matched against the lower-cased, comma-joined phases.
    #[serde(default = "default_phase_needles")]
    pub phase_needles: Vec<String>,
}

fn default_study_type() -> String {
    "INTERVENTIONAL".to_string()
}

fn default_phase_needles() -> Vec<String> {
    ["phase2", "phase 2", "phase3", "phase 3"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for CohortFilter {
    fn default() -> Self {
        Self {
            study_type: default_study_type(),
            phase_needles: default_phase_needles(),
        }
    }
}

impl CohortFilter {
    pub fn matches(&self, trial: &NormalizedTrial) -> bool {
        if trial.study_type.as_deref() != Some(self.study_type.as_str()) {
            return false;
        }
        let joined = trial.phases.join(",").to_lowercase();
        self.phase_needles
            .iter()
            .any(|needle| joined.contains(&needle.to_lowercase()))
    }
}

#[derive(Default)]
struct Counts {
    early_stop: u64,
    closed: u64,
}

/// Aggregate trials into one metric row per sponsor class seen in the cohort.
///
/// Trials without an NCT id are skipped; callers are expected to have removed
/// them already.
pub fn aggregate(trials: &[NormalizedTrial], filter: &CohortFilter) -> Vec<SponsorMetric> {
    let mut groups: BTreeMap<&str, Counts> = BTreeMap::new();
    let mut cohort_size = 0usize;

    for trial in trials
        .iter()
        .filter(|t| t.nct_id.is_some() && filter.matches(t))
    {
        cohort_size += 1;
        let class = trial
            .sponsor_class
            .as_deref()
            .unwrap_or(UNKNOWN_SPONSOR_CLASS);
        let counts = groups.entry(class).or_default();
        if let Some(status) = &trial.overall_status {
            if status.is_early_stop() {
                counts.early_stop += 1;
            }
            if status.is_closed() {
                counts.closed += 1;
            }
        }
    }

    debug!(
        "Aggregated {} cohort trials into {} sponsor classes",
        cohort_size,
        groups.len()
    );

    groups
        .into_iter()
        .map(|(class, c)| SponsorMetric::from_counts(class, c.early_stop, c.closed))
        .collect()
}

/// Number of trials that pass the cohort filter.
pub fn cohort_size(trials: &[NormalizedTrial], filter: &CohortFilter) -> usize {
    trials
        .iter()
        .filter(|t| t.nct_id.is_some() && filter.matches(t))
        .count()
}
