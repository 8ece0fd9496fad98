//! Pipeline run
//!
//! One run: select the latest committed batch, normalize it, aggregate it,
//! check guardrails, and publish only if every guardrail passes. Each run
//! recomputes the full output from the selected batch; nothing is carried
//! over from previous runs.

use crate::aggregate::{aggregate, cohort_size};
use crate::config::PipelineConfig;
use crate::guardrail::{GuardrailValidator, GuardrailViolation, RunDiagnostics};
use crate::models::{BatchId, NormalizedTrial, RawRecord, SponsorMetric};
use crate::normalize::normalize_batch;
use crate::publish::{MetricsPublisher, PublishError, PublishedRun};
use crate::selector::select_latest;
use crate::store::{BatchStore, StoreError};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Passed,
    Failed,
}

/// Outcome of one run, printed by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub batch_id: Option<BatchId>,
    pub status: RunStatus,
    pub published: bool,
    pub records_scanned: usize,
    pub trials_normalized: usize,
    pub cohort_size: usize,
    pub diagnostics: RunDiagnostics,
    pub metrics: Vec<SponsorMetric>,
    pub violations: Vec<GuardrailViolation>,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.status == RunStatus::Passed
    }
}

/// Output of the pure transform stage, before validation.
#[derive(Debug, Clone)]
pub struct Transformed {
    pub trials: Vec<NormalizedTrial>,
    pub metrics: Vec<SponsorMetric>,
    pub cohort_size: usize,
    pub diagnostics: RunDiagnostics,
}

pub struct Pipeline {
    store: Arc<dyn BatchStore>,
    publisher: Arc<dyn MetricsPublisher>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn BatchStore>,
        publisher: Arc<dyn MetricsPublisher>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    /// Normalize and aggregate already-loaded records. Pure.
    pub fn transform(&self, records: &[RawRecord]) -> Transformed {
        let batch = normalize_batch(records);
        let metrics = aggregate(&batch.trials, &self.config.cohort);
        Transformed {
            cohort_size: cohort_size(&batch.trials, &self.config.cohort),
            diagnostics: RunDiagnostics {
                dropped_missing_id: batch.dropped_missing_id,
                duplicate_ids: batch.duplicate_ids,
                date_conflicts: batch.date_conflicts,
            },
            trials: batch.trials,
            metrics,
        }
    }

    /// Run end to end. With `publish == false` the run is validated but
    /// nothing is written.
    pub fn run(&self, publish: bool) -> Result<RunReport, PipelineError> {
        let batch_id = select_latest(self.store.as_ref())?;

        // Barrier: the whole batch is materialized before aggregation starts
        let records: Vec<RawRecord> = match &batch_id {
            Some(id) => self
                .store
                .scan_by_batch(id)?
                .collect::<Result<Vec<_>, StoreError>>()?,
            None => {
                warn!("No committed batch in store, treating as empty cohort");
                Vec::new()
            }
        };
        info!(
            "Running pipeline on batch {} ({} records)",
            batch_id.as_ref().map(BatchId::as_str).unwrap_or("<none>"),
            records.len()
        );

        let transformed = self.transform(&records);
        let report = GuardrailValidator::new(self.config.guardrail.clone())
            .validate(&transformed.metrics, transformed.diagnostics);

        let mut published = false;
        if report.passed && publish {
            self.publisher.publish(&PublishedRun {
                batch_id: batch_id.as_ref(),
                trials: &transformed.trials,
                metrics: &transformed.metrics,
                dropped_missing_id: transformed.diagnostics.dropped_missing_id,
                published_at: Utc::now(),
            })?;
            published = true;
        } else if !report.passed {
            warn!(
                "Guardrails failed with {} violations, previous output left in place",
                report.violations.len()
            );
        }

        Ok(RunReport {
            batch_id,
            status: if report.passed {
                RunStatus::Passed
            } else {
                RunStatus::Failed
            },
            published,
            records_scanned: records.len(),
            trials_normalized: transformed.trials.len(),
            cohort_size: transformed.cohort_size,
            diagnostics: report.diagnostics,
            metrics: transformed.metrics,
            violations: report.violations,
        })
    }
}

#[derive(Debug)]
pub enum PipelineError {
    Store(StoreError),
    Publish(PublishError),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(e) => write!(f, "Batch store error: {}", e),
            Self::Publish(e) => write!(f, "Publish error: {}", e),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<PublishError> for PipelineError {
    fn from(e: PublishError) -> Self {
        Self::Publish(e)
    }
}
