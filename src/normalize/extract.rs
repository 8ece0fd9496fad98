//! Typed field extractors over the raw study document.
//!
//! Each extractor reads one fixed path and returns `None` when the path is
//! missing or JSON `null`. Schema-variant fields are resolved by trying an
//! ordered list of extractors and keeping the first present value.

use chrono::{DateTime, NaiveDate};
use serde_json::Value;

/// A dotted path into the study document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldPath(pub &'static [&'static str]);

impl FieldPath {
    /// Value at this path; JSON `null` counts as absent.
    pub fn lookup<'a>(&self, doc: &'a Value) -> Option<&'a Value> {
        let mut cur = doc;
        for key in self.0 {
            cur = cur.get(*key)?;
        }
        if cur.is_null() {
            None
        } else {
            Some(cur)
        }
    }

    pub fn string(&self, doc: &Value) -> Option<String> {
        self.lookup(doc).and_then(Value::as_str).map(str::to_string)
    }

    pub fn dotted(&self) -> String {
        self.0.join(".")
    }
}

pub const NCT_ID: FieldPath = FieldPath(&["protocolSection", "identificationModule", "nctId"]);
pub const BRIEF_TITLE: FieldPath =
    FieldPath(&["protocolSection", "identificationModule", "briefTitle"]);
pub const OVERALL_STATUS: FieldPath =
    FieldPath(&["protocolSection", "statusModule", "overallStatus"]);
pub const STUDY_TYPE: FieldPath = FieldPath(&["protocolSection", "designModule", "studyType"]);
pub const PHASES: FieldPath = FieldPath(&["protocolSection", "designModule", "phases"]);
pub const HAS_RESULTS: FieldPath = FieldPath(&["hasResults"]);

/// Sponsor class field names, in priority order.
pub const SPONSOR_CLASS_CANDIDATES: [FieldPath; 2] = [
    FieldPath(&["protocolSection", "sponsorCollaboratorsModule", "leadSponsor", "class"]),
    FieldPath(&["protocolSection", "sponsorCollaboratorsModule", "leadSponsor", "agencyClass"]),
];

/// Shape of one first-submitted-date variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateForm {
    /// `{ "date": "..." }` object under the parent name.
    Struct,
    /// Plain string under the field name.
    Scalar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateCandidate {
    pub form: DateForm,
    pub path: FieldPath,
}

/// First-submitted-date variants across API generations, in priority order:
/// struct/newest, scalar/newest, struct/legacy, scalar/legacy.
pub const FIRST_SUBMITTED_DATE_CANDIDATES: [DateCandidate; 4] = [
    DateCandidate {
        form: DateForm::Struct,
        path: FieldPath(&["protocolSection", "statusModule", "studyFirstSubmitDateStruct", "date"]),
    },
    DateCandidate {
        form: DateForm::Scalar,
        path: FieldPath(&["protocolSection", "statusModule", "studyFirstSubmitDate"]),
    },
    DateCandidate {
        form: DateForm::Struct,
        path: FieldPath(&["protocolSection", "statusModule", "firstSubmitDateStruct", "date"]),
    },
    DateCandidate {
        form: DateForm::Scalar,
        path: FieldPath(&["protocolSection", "statusModule", "firstSubmitDate"]),
    },
];

/// Which date candidate won, and what it parsed to.
#[derive(Debug, Clone, PartialEq)]
pub struct DateResolution {
    /// Index into `FIRST_SUBMITTED_DATE_CANDIDATES`; `None` if nothing was present.
    pub candidate: Option<usize>,
    pub date: Option<NaiveDate>,
    /// Later-priority candidates that were present with a different parsed value.
    pub shadowed_conflicts: usize,
}

/// Resolve the first-submitted date.
///
/// The first present candidate wins even if it fails to parse; later
/// candidates are never consulted as a fallback.
pub fn resolve_first_submitted(doc: &Value) -> DateResolution {
    let mut present = FIRST_SUBMITTED_DATE_CANDIDATES
        .iter()
        .enumerate()
        .filter_map(|(i, c)| c.path.lookup(doc).map(|v| (i, parse_date_value(v))));

    let Some((index, date)) = present.next() else {
        return DateResolution {
            candidate: None,
            date: None,
            shadowed_conflicts: 0,
        };
    };
    let shadowed_conflicts = present.filter(|(_, other)| *other != date).count();

    DateResolution {
        candidate: Some(index),
        date,
        shadowed_conflicts,
    }
}

fn parse_date_value(value: &Value) -> Option<NaiveDate> {
    value.as_str().and_then(parse_date)
}

/// Parse a calendar date as the registry has emitted it over time.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.date_naive()))
        // Classic API long form, e.g. "March 2, 2015"
        .or_else(|| NaiveDate::parse_from_str(s, "%B %d, %Y").ok())
}

/// First sponsor-class variant holding a string.
pub fn resolve_sponsor_class(doc: &Value) -> Option<String> {
    SPONSOR_CLASS_CANDIDATES.iter().find_map(|p| p.string(doc))
}
