//! Core record types shared across the pipeline.
//!
//! `RawRecord` is what ingestion appends, `NormalizedTrial` is what the
//! normalizer produces, and `SponsorMetric` is the published aggregate row.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sponsor category used when neither sponsor-class field resolves.
pub const UNKNOWN_SPONSOR_CLASS: &str = "UNKNOWN";

/// Opaque identifier shared by every record of one ingestion run.
///
/// Ordering is plain lexicographic string ordering, which the latest-batch
/// selector relies on for its tie-break.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Id in the `batch_YYYYMMDD_HHMMSS_ffffff` shape used by the file importer.
    /// Microseconds keep two imports within the same second apart, and the
    /// fixed width keeps lexicographic order chronological.
    pub fn from_timestamp(ts: DateTime<Utc>) -> Self {
        Self(format!("batch_{}", ts.format("%Y%m%d_%H%M%S_%6f")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BatchId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One raw study document as appended by ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub payload: serde_json::Value,
    pub ingested_at: DateTime<Utc>,
    pub batch_id: BatchId,
}

impl RawRecord {
    pub fn new(batch_id: BatchId, ingested_at: DateTime<Utc>, payload: serde_json::Value) -> Self {
        Self {
            payload,
            ingested_at,
            batch_id,
        }
    }
}

/// Overall recruitment status as reported by the registry.
///
/// Codes are matched case-sensitively; anything unrecognized is kept verbatim
/// in `Other` so it still shows up in the normalized view.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OverallStatus {
    Completed,
    Terminated,
    Withdrawn,
    Suspended,
    Recruiting,
    ActiveNotRecruiting,
    NotYetRecruiting,
    EnrollingByInvitation,
    Unknown,
    Withheld,
    NoLongerAvailable,
    Available,
    ApprovedForMarketing,
    TemporarilyNotAvailable,
    Other(String),
}

impl OverallStatus {
    pub fn parse(code: &str) -> Self {
        match code {
            "COMPLETED" => Self::Completed,
            "TERMINATED" => Self::Terminated,
            "WITHDRAWN" => Self::Withdrawn,
            "SUSPENDED" => Self::Suspended,
            "RECRUITING" => Self::Recruiting,
            "ACTIVE_NOT_RECRUITING" => Self::ActiveNotRecruiting,
            "NOT_YET_RECRUITING" => Self::NotYetRecruiting,
            "ENROLLING_BY_INVITATION" => Self::EnrollingByInvitation,
            "UNKNOWN" => Self::Unknown,
            "WITHHELD" => Self::Withheld,
            "NO_LONGER_AVAILABLE" => Self::NoLongerAvailable,
            "AVAILABLE" => Self::Available,
            "APPROVED_FOR_MARKETING" => Self::ApprovedForMarketing,
            "TEMPORARILY_NOT_AVAILABLE" => Self::TemporarilyNotAvailable,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Completed => "COMPLETED",
            Self::Terminated => "TERMINATED",
            Self::Withdrawn => "WITHDRAWN",
            Self::Suspended => "SUSPENDED",
            Self::Recruiting => "RECRUITING",
            Self::ActiveNotRecruiting => "ACTIVE_NOT_RECRUITING",
            Self::NotYetRecruiting => "NOT_YET_RECRUITING",
            Self::EnrollingByInvitation => "ENROLLING_BY_INVITATION",
            Self::Unknown => "UNKNOWN",
            Self::Withheld => "WITHHELD",
            Self::NoLongerAvailable => "NO_LONGER_AVAILABLE",
            Self::Available => "AVAILABLE",
            Self::ApprovedForMarketing => "APPROVED_FOR_MARKETING",
            Self::TemporarilyNotAvailable => "TEMPORARILY_NOT_AVAILABLE",
            Self::Other(code) => code,
        }
    }

    /// Terminated, withdrawn or suspended.
    pub fn is_early_stop(&self) -> bool {
        matches!(self, Self::Terminated | Self::Withdrawn | Self::Suspended)
    }

    /// Completed or any early-stop status. Always a superset of `is_early_stop`.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Completed) || self.is_early_stop()
    }
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for OverallStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for OverallStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        Ok(Self::parse(&code))
    }
}

/// Flat, typed view of one study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedTrial {
    /// `None` marks a record the caller must exclude from aggregation.
    pub nct_id: Option<String>,
    pub brief_title: Option<String>,
    pub overall_status: Option<OverallStatus>,
    pub first_submitted_date: Option<NaiveDate>,
    pub study_type: Option<String>,
    /// Canonical phase tags in source order.
    pub phases: Vec<String>,
    /// Unresolved stays `None` here; aggregation coalesces to `UNKNOWN`.
    pub sponsor_class: Option<String>,
    pub has_results: Option<bool>,
}

/// Per-sponsor-class stability row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SponsorMetric {
    pub sponsor_class: String,
    #[serde(rename = "early_stop_trials")]
    pub early_stop_count: u64,
    #[serde(rename = "closed_trials")]
    pub closed_count: u64,
    /// `None` when `closed_count == 0`; never reported as zero in that case.
    pub early_stop_rate: Option<f64>,
}

impl SponsorMetric {
    pub fn from_counts(sponsor_class: impl Into<String>, early_stop_count: u64, closed_count: u64) -> Self {
        let early_stop_rate = if closed_count > 0 {
            Some(early_stop_count as f64 / closed_count as f64)
        } else {
            None
        };
        Self {
            sponsor_class: sponsor_class.into(),
            early_stop_count,
            closed_count,
            early_stop_rate,
        }
    }
}
