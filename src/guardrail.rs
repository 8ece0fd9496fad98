//! Output Guardrails
//!
//! Invariant checks run on the metric table before it is published. Any
//! violation fails the whole run; a partially correct table is never published.
//!
//! # Checks
//!
//! - early stop rate is undefined or a finite value in [0, 1]
//! - early stop count never exceeds closed count
//! - rate is defined exactly when closed count is positive
//! - excluded-record count stays under the operator threshold (if set)
//! - cohort is non-empty (only if the operator asks for it)

use crate::models::SponsorMetric;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Operator-tunable guardrail policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardrailPolicy {
    /// Fail when more records than this were excluded for a missing NCT id.
    #[serde(default)]
    pub max_dropped_records: Option<u64>,

    /// Fail when the run produced no metric rows.
    #[serde(default)]
    pub require_non_empty: bool,
}

/// Pre-aggregation counts surfaced alongside the verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RunDiagnostics {
    pub dropped_missing_id: u64,
    pub duplicate_ids: u64,
    pub date_conflicts: u64,
}

/// A single broken invariant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GuardrailViolation {
    RateOutOfRange { sponsor_class: String, rate: f64 },
    EarlyStopExceedsClosed { sponsor_class: String, early_stop: u64, closed: u64 },
    RateDefinedWithoutClosed { sponsor_class: String },
    RateMissingWithClosed { sponsor_class: String, closed: u64 },
    TooManyDropped { dropped: u64, threshold: u64 },
    EmptyCohort,
}

impl std::fmt::Display for GuardrailViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateOutOfRange { sponsor_class, rate } => {
                write!(f, "{}: early_stop_rate {} outside [0, 1]", sponsor_class, rate)
            }
            Self::EarlyStopExceedsClosed {
                sponsor_class,
                early_stop,
                closed,
            } => write!(
                f,
                "{}: early_stop_trials {} > closed_trials {}",
                sponsor_class, early_stop, closed
            ),
            Self::RateDefinedWithoutClosed { sponsor_class } => {
                write!(f, "{}: rate defined with zero closed trials", sponsor_class)
            }
            Self::RateMissingWithClosed {
                sponsor_class,
                closed,
            } => write!(
                f,
                "{}: rate undefined with {} closed trials",
                sponsor_class, closed
            ),
            Self::TooManyDropped { dropped, threshold } => write!(
                f,
                "{} records dropped for missing NCT id (threshold {})",
                dropped, threshold
            ),
            Self::EmptyCohort => write!(f, "no metric rows produced"),
        }
    }
}

/// Verdict plus diagnostics for one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub passed: bool,
    pub rows_checked: usize,
    pub diagnostics: RunDiagnostics,
    pub violations: Vec<GuardrailViolation>,
}

/// Rows whose rate is defined and outside [0, 1]. Empty on a healthy run.
pub fn out_of_range_rows(metrics: &[SponsorMetric]) -> Vec<&SponsorMetric> {
    metrics
        .iter()
        .filter(|m| matches!(m.early_stop_rate, Some(rate) if !rate_in_range(rate)))
        .collect()
}

fn rate_in_range(rate: f64) -> bool {
    rate.is_finite() && (0.0..=1.0).contains(&rate)
}

pub struct GuardrailValidator {
    policy: GuardrailPolicy,
}

impl GuardrailValidator {
    pub fn new(policy: GuardrailPolicy) -> Self {
        Self { policy }
    }

    pub fn validate(&self, metrics: &[SponsorMetric], diagnostics: RunDiagnostics) -> ValidationReport {
        let mut violations = Vec::new();

        for m in metrics {
            if let Some(rate) = m.early_stop_rate {
                if !rate_in_range(rate) {
                    violations.push(GuardrailViolation::RateOutOfRange {
                        sponsor_class: m.sponsor_class.clone(),
                        rate,
                    });
                }
            }
            if m.early_stop_count > m.closed_count {
                violations.push(GuardrailViolation::EarlyStopExceedsClosed {
                    sponsor_class: m.sponsor_class.clone(),
                    early_stop: m.early_stop_count,
                    closed: m.closed_count,
                });
            }
            match (m.early_stop_rate, m.closed_count) {
                (Some(_), 0) => violations.push(GuardrailViolation::RateDefinedWithoutClosed {
                    sponsor_class: m.sponsor_class.clone(),
                }),
                (None, closed) if closed > 0 => {
                    violations.push(GuardrailViolation::RateMissingWithClosed {
                        sponsor_class: m.sponsor_class.clone(),
                        closed,
                    })
                }
                _ => {}
            }
        }

        if let Some(threshold) = self.policy.max_dropped_records {
            if diagnostics.dropped_missing_id > threshold {
                violations.push(GuardrailViolation::TooManyDropped {
                    dropped: diagnostics.dropped_missing_id,
                    threshold,
                });
            }
        }

        if self.policy.require_non_empty && metrics.is_empty() {
            violations.push(GuardrailViolation::EmptyCohort);
        }

        let passed = violations.is_empty();
        if passed {
            info!(
                "Guardrails passed: {} rows, {} records dropped",
                metrics.len(),
                diagnostics.dropped_missing_id
            );
        } else {
            for v in &violations {
                error!("Guardrail violation: {}", v);
            }
        }

        ValidationReport {
            passed,
            rows_checked: metrics.len(),
            diagnostics,
            violations,
        }
    }
}
