//! Append-only Batch Store
//!
//! Raw study documents partitioned by batch id. A batch becomes visible to
//! readers only once it is committed as a whole; there is no update or delete.
//!
//! # Commit boundary
//!
//! ```ignore
//! let mut writer = BatchWriter::new(&store, BatchId::new("batch_20250101_000000_000000"));
//! writer.append(payload, Utc::now());
//! writer.commit()?; // all rows become visible together
//! ```
//!
//! Dropping a writer without calling `commit` discards everything it staged.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryBatchStore;
pub use sqlite::SqliteBatchStore;

use crate::models::{BatchId, RawRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

/// Lazy sequence of committed records.
pub type RecordScan<'a> = Box<dyn Iterator<Item = Result<RawRecord, StoreError>> + 'a>;

/// Receipt for a committed batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchCommit {
    pub batch_id: BatchId,
    pub record_count: usize,
    pub committed_at: DateTime<Utc>,
}

/// Per-batch row count and ingestion time range, read from metadata only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub batch_id: BatchId,
    pub record_count: usize,
    pub first_ingested_at: DateTime<Utc>,
    pub last_ingested_at: DateTime<Utc>,
}

/// Storage backend for raw snapshot records.
pub trait BatchStore: Send + Sync {
    /// Commit one whole batch. Either every record becomes visible or none does.
    fn append_batch(&self, records: Vec<RawRecord>) -> Result<BatchCommit, StoreError>;

    /// All committed records, batch by batch in commit order.
    fn scan_all(&self) -> Result<RecordScan<'_>, StoreError>;

    /// Committed records of a single batch. Unknown ids yield an empty scan.
    fn scan_by_batch(&self, batch_id: &BatchId) -> Result<RecordScan<'_>, StoreError>;

    /// One summary per committed batch, in no particular order. Payloads are
    /// not decoded, so a corrupt row never hides its batch's metadata.
    fn batch_summaries(&self) -> Result<Vec<BatchSummary>, StoreError>;
}

/// Stages records for one batch until `commit`.
pub struct BatchWriter<'a> {
    store: &'a dyn BatchStore,
    batch_id: BatchId,
    staged: Vec<RawRecord>,
}

impl<'a> BatchWriter<'a> {
    pub fn new(store: &'a dyn BatchStore, batch_id: BatchId) -> Self {
        Self {
            store,
            batch_id,
            staged: Vec::new(),
        }
    }

    pub fn batch_id(&self) -> &BatchId {
        &self.batch_id
    }

    /// Stage a payload under this writer's batch id.
    pub fn append(&mut self, payload: serde_json::Value, ingested_at: DateTime<Utc>) {
        self.staged
            .push(RawRecord::new(self.batch_id.clone(), ingested_at, payload));
    }

    /// Stage a fully-formed record. Its batch id must match the writer's.
    pub fn append_record(&mut self, record: RawRecord) -> Result<(), StoreError> {
        if record.batch_id != self.batch_id {
            return Err(StoreError::MixedBatch {
                expected: self.batch_id.clone(),
                found: record.batch_id,
            });
        }
        self.staged.push(record);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    pub fn commit(mut self) -> Result<BatchCommit, StoreError> {
        let records = std::mem::take(&mut self.staged);
        self.store.append_batch(records)
    }
}

impl Drop for BatchWriter<'_> {
    fn drop(&mut self) {
        if !self.staged.is_empty() {
            debug!(
                "Discarding {} uncommitted records for batch {}",
                self.staged.len(),
                self.batch_id
            );
        }
    }
}

/// Wrapper-level checks shared by every backend. Payloads stay opaque.
pub(crate) fn check_well_formed(records: &[RawRecord]) -> Result<BatchId, StoreError> {
    let first = records.first().ok_or(StoreError::EmptyBatch)?;
    if first.batch_id.is_blank() {
        return Err(StoreError::EmptyBatchId);
    }
    if let Some(stray) = records.iter().find(|r| r.batch_id != first.batch_id) {
        return Err(StoreError::MixedBatch {
            expected: first.batch_id.clone(),
            found: stray.batch_id.clone(),
        });
    }
    Ok(first.batch_id.clone())
}

/// Errors from batch storage.
#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Serialization(serde_json::Error),
    /// Stored payload could not be decoded back into a document.
    CorruptPayload { batch_id: BatchId, reason: String },
    /// Stored timestamp is outside the representable range.
    InvalidTimestamp(i64),
    EmptyBatchId,
    EmptyBatch,
    MixedBatch { expected: BatchId, found: BatchId },
    BatchAlreadyCommitted(BatchId),
    Io(std::io::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(e) => write!(f, "SQLite error: {}", e),
            Self::Serialization(e) => write!(f, "Serialization error: {}", e),
            Self::CorruptPayload { batch_id, reason } => {
                write!(f, "Corrupt payload in batch {}: {}", batch_id, reason)
            }
            Self::InvalidTimestamp(us) => write!(f, "Invalid ingestion timestamp: {}us", us),
            Self::EmptyBatchId => write!(f, "Batch id must not be empty"),
            Self::EmptyBatch => write!(f, "Refusing to commit an empty batch"),
            Self::MixedBatch { expected, found } => write!(
                f,
                "Record for batch {} staged in batch {}",
                found, expected
            ),
            Self::BatchAlreadyCommitted(id) => write!(f, "Batch already committed: {}", id),
            Self::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(batch: &str) -> RawRecord {
        RawRecord::new(BatchId::from(batch), Utc::now(), json!({}))
    }

    #[test]
    fn test_well_formed_rejects_empty_and_mixed_batches() {
        assert!(matches!(check_well_formed(&[]), Err(StoreError::EmptyBatch)));
        assert!(matches!(
            check_well_formed(&[record("  ")]),
            Err(StoreError::EmptyBatchId)
        ));
        assert!(matches!(
            check_well_formed(&[record("a"), record("b")]),
            Err(StoreError::MixedBatch { .. })
        ));
        assert_eq!(
            check_well_formed(&[record("a"), record("a")]).unwrap(),
            BatchId::from("a")
        );
    }

    #[test]
    fn test_writer_rejects_foreign_record() {
        let store = MemoryBatchStore::new();
        let mut writer = BatchWriter::new(&store, BatchId::from("a"));
        assert!(writer.append_record(record("b")).is_err());
        assert!(writer.append_record(record("a")).is_ok());
        assert_eq!(writer.len(), 1);
    }

    #[test]
    fn test_dropped_writer_publishes_nothing() {
        let store = MemoryBatchStore::new();
        {
            let mut writer = BatchWriter::new(&store, BatchId::from("aborted"));
            writer.append(json!({"x": 1}), Utc::now());
            writer.append(json!({"x": 2}), Utc::now());
        }
        assert_eq!(store.scan_all().unwrap().count(), 0);
    }
}
