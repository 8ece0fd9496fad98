//! Dump-file import.
//!
//! Fetching from the registry API happens elsewhere; this module only loads
//! what a fetch run wrote to disk and appends it to the store as one batch.
//! Accepted shapes:
//! - NDJSON, one study document per line
//! - a JSON array of studies
//! - an API page object with a `studies` array

use crate::models::BatchId;
use crate::store::{BatchCommit, BatchStore, BatchWriter, StoreError};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug)]
pub enum IngestError {
    Io(std::io::Error),
    /// Line number is 1-based; 0 for whole-document parse failures.
    Parse { line: usize, source: serde_json::Error },
    UnexpectedShape(String),
    Store(StoreError),
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::Parse { line: 0, source } => write!(f, "Invalid JSON document: {}", source),
            Self::Parse { line, source } => write!(f, "Invalid JSON on line {}: {}", line, source),
            Self::UnexpectedShape(shape) => write!(f, "Unexpected dump shape: {}", shape),
            Self::Store(e) => write!(f, "Store error: {}", e),
        }
    }
}

impl std::error::Error for IngestError {}

impl From<std::io::Error> for IngestError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<StoreError> for IngestError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// Read study documents from a dump file.
pub fn read_studies(path: impl AsRef<Path>) -> Result<Vec<Value>, IngestError> {
    let contents = std::fs::read_to_string(path)?;
    parse_studies(&contents)
}

/// Parse dump contents in any of the accepted shapes.
pub fn parse_studies(contents: &str) -> Result<Vec<Value>, IngestError> {
    let trimmed = contents.trim_start();
    if trimmed.starts_with('[') {
        return match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Array(items)) => Ok(items),
            Ok(_) => Err(IngestError::UnexpectedShape("array expected".to_string())),
            Err(source) => Err(IngestError::Parse { line: 0, source }),
        };
    }

    // A single API page spans multiple lines when pretty-printed
    if let Ok(Value::Object(mut page)) = serde_json::from_str::<Value>(trimmed) {
        return match page.remove("studies") {
            Some(Value::Array(items)) => Ok(items),
            Some(Value::Null) => Ok(Vec::new()),
            Some(_) => Err(IngestError::UnexpectedShape("`studies` is not an array".to_string())),
            // One-line NDJSON file holding a single study
            None => Ok(vec![Value::Object(page)]),
        };
    }

    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|source| IngestError::Parse { line: i + 1, source })
        })
        .collect()
}

/// Append studies as one new batch. Empty input writes nothing.
pub fn import_studies(
    store: &dyn BatchStore,
    studies: Vec<Value>,
    now: DateTime<Utc>,
) -> Result<Option<BatchCommit>, IngestError> {
    if studies.is_empty() {
        warn!("No studies to import");
        return Ok(None);
    }

    let mut writer = BatchWriter::new(store, BatchId::from_timestamp(now));
    for study in studies {
        writer.append(study, now);
    }
    let commit = writer.commit()?;
    info!(
        "Imported {} studies as batch {}",
        commit.record_count, commit.batch_id
    );
    Ok(Some(commit))
}
