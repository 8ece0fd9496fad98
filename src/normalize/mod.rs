//! Field Normalization
//!
//! Maps raw, schema-variant study documents into flat `NormalizedTrial`s.
//!
//! - Optional fields that are missing or unparsable become `None`; the record
//!   is still produced.
//! - Records without an NCT id are excluded by `normalize_batch` and counted.
//! - Phase encodings are collapsed here, so no encoding ambiguity reaches
//!   aggregation.

pub mod extract;
pub mod phases;


use crate::models::{NormalizedTrial, OverallStatus, RawRecord};
use extract::{resolve_first_submitted, resolve_sponsor_class, DateResolution};
use phases::PhaseEncoding;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Normalize one raw record. Total: never fails, only yields `None` fields.
pub fn normalize(raw: &RawRecord) -> NormalizedTrial {
    normalize_with_resolution(raw).0
}

/// Normalized trial plus the date resolution it was built from.
fn normalize_with_resolution(raw: &RawRecord) -> (NormalizedTrial, DateResolution) {
    let doc = &raw.payload;
    let resolution = resolve_first_submitted(doc);

    let nct_id = extract::NCT_ID
        .string(doc)
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty());

    let trial = NormalizedTrial {
        nct_id,
        brief_title: extract::BRIEF_TITLE.string(doc),
        overall_status: extract::OVERALL_STATUS
            .string(doc)
            .map(|s| OverallStatus::parse(&s)),
        first_submitted_date: resolution.date,
        study_type: extract::STUDY_TYPE.string(doc),
        phases: PhaseEncoding::classify(extract::PHASES.lookup(doc)).into_tags(),
        sponsor_class: resolve_sponsor_class(doc),
        has_results: extract::HAS_RESULTS.lookup(doc).and_then(|v| v.as_bool()),
    };
    (trial, resolution)
}

/// Normalized trials of one batch plus the diagnostics the guardrail needs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NormalizedBatch {
    /// Trials with an NCT id, in input order.
    pub trials: Vec<NormalizedTrial>,
    /// Records excluded for lacking an NCT id.
    pub dropped_missing_id: u64,
    /// Extra occurrences of an NCT id already seen in the batch (kept, not dropped).
    pub duplicate_ids: u64,
    /// Records whose winning date candidate shadowed a different later value.
    pub date_conflicts: u64,
}

/// Normalize a whole batch in parallel. Output order matches input order.
pub fn normalize_batch(records: &[RawRecord]) -> NormalizedBatch {
    let normalized: Vec<(NormalizedTrial, bool)> = records
        .par_iter()
        .map(|r| {
            let (trial, resolution) = normalize_with_resolution(r);
            (trial, resolution.shadowed_conflicts > 0)
        })
        .collect();

    let mut batch = NormalizedBatch::default();
    let mut seen: HashMap<String, u64> = HashMap::new();
    for (trial, conflicted) in normalized {
        if conflicted {
            batch.date_conflicts += 1;
        }
        match &trial.nct_id {
            Some(id) => {
                let count = seen.entry(id.clone()).or_insert(0);
                *count += 1;
                if *count > 1 {
                    batch.duplicate_ids += 1;
                }
                batch.trials.push(trial);
            }
            None => batch.dropped_missing_id += 1,
        }
    }

    if batch.dropped_missing_id > 0 {
        warn!(
            "Excluded {} of {} records without an NCT id",
            batch.dropped_missing_id,
            records.len()
        );
    }
    if batch.duplicate_ids > 0 {
        warn!("{} duplicate NCT ids in batch", batch.duplicate_ids);
    }
    if batch.date_conflicts > 0 {
        debug!(
            "{} records carry conflicting first-submitted date variants",
            batch.date_conflicts
        );
    }
    batch
}
