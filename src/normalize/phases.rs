//! Phase encodings.
//!
//! The registry has shipped phases as a list, a comma-joined string, a lone
//! tag, or not at all. `PhaseEncoding` names those shapes; `into_tags`
//! collapses every one of them into an ordered tag list.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseEncoding {
    List(Vec<String>),
    Joined(String),
    Scalar(String),
    Absent,
}

impl PhaseEncoding {
    /// Classify a raw `phases` value (already `None` for missing/null).
    pub fn classify(raw: Option<&Value>) -> Self {
        match raw {
            None => Self::Absent,
            Some(Value::Array(items)) => Self::List(
                items
                    .iter()
                    .filter_map(|item| match item {
                        Value::String(s) => Some(s.clone()),
                        Value::Null => None,
                        other => Some(other.to_string()),
                    })
                    .collect(),
            ),
            Some(Value::String(s)) if s.contains(',') => Self::Joined(s.clone()),
            Some(Value::String(s)) => Self::Scalar(s.clone()),
            Some(Value::Null) => Self::Absent,
            Some(other) => Self::Scalar(other.to_string()),
        }
    }

    /// Canonical tags in source order. Whitespace is trimmed and empty
    /// fragments are dropped; no sorting or deduplication.
    pub fn into_tags(self) -> Vec<String> {
        let tags: Vec<String> = match self {
            Self::List(items) => items,
            Self::Joined(joined) => joined.split(',').map(str::to_string).collect(),
            Self::Scalar(tag) => vec![tag],
            Self::Absent => Vec::new(),
        };
        tags.into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tags(raw: Value) -> Vec<String> {
        let raw = if raw.is_null() { None } else { Some(&raw) };
        PhaseEncoding::classify(raw).into_tags()
    }

    #[test]
    fn test_list_kept_in_order() {
        assert_eq!(tags(json!(["PHASE2", "PHASE1"])), vec!["PHASE2", "PHASE1"]);
        assert_eq!(tags(json!(["PHASE2", "PHASE2"])), vec!["PHASE2", "PHASE2"]);
    }

    #[test]
    fn test_joined_string_split_on_comma() {
        assert_eq!(
            PhaseEncoding::classify(Some(&json!("PHASE2,PHASE3"))),
            PhaseEncoding::Joined("PHASE2,PHASE3".to_string())
        );
        assert_eq!(tags(json!("PHASE2, PHASE3,")), vec!["PHASE2", "PHASE3"]);
    }

    #[test]
    fn test_scalar_becomes_single_tag() {
        assert_eq!(
            PhaseEncoding::classify(Some(&json!("PHASE3"))),
            PhaseEncoding::Scalar("PHASE3".to_string())
        );
        assert_eq!(tags(json!("PHASE3")), vec!["PHASE3"]);
    }

    #[test]
    fn test_absent_is_empty() {
        assert_eq!(PhaseEncoding::classify(None), PhaseEncoding::Absent);
        assert!(tags(Value::Null).is_empty());
        assert!(tags(json!([])).is_empty());
        assert!(tags(json!("")).is_empty());
    }
}
