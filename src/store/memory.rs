//! In-memory batch store, used by tests and dry runs.

use super::{check_well_formed, BatchCommit, BatchStore, BatchSummary, RecordScan, StoreError};
use crate::models::{BatchId, RawRecord};
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;

struct CommittedBatch {
    batch_id: BatchId,
    records: Vec<RawRecord>,
}

/// Committed batches kept in commit order.
#[derive(Default)]
pub struct MemoryBatchStore {
    batches: RwLock<Vec<Arc<CommittedBatch>>>,
}

impl MemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.read().len()
    }

    fn snapshot(&self) -> Vec<Arc<CommittedBatch>> {
        self.batches.read().clone()
    }
}

fn iterate(batches: Vec<Arc<CommittedBatch>>) -> RecordScan<'static> {
    Box::new(batches.into_iter().flat_map(|batch| {
        let len = batch.records.len();
        (0..len).map(move |i| Ok::<_, StoreError>(batch.records[i].clone()))
    }))
}

impl BatchStore for MemoryBatchStore {
    fn append_batch(&self, records: Vec<RawRecord>) -> Result<BatchCommit, StoreError> {
        let batch_id = check_well_formed(&records)?;
        let mut batches = self.batches.write();
        if batches.iter().any(|b| b.batch_id == batch_id) {
            return Err(StoreError::BatchAlreadyCommitted(batch_id));
        }

        let commit = BatchCommit {
            batch_id: batch_id.clone(),
            record_count: records.len(),
            committed_at: Utc::now(),
        };
        batches.push(Arc::new(CommittedBatch { batch_id, records }));
        Ok(commit)
    }

    fn scan_all(&self) -> Result<RecordScan<'_>, StoreError> {
        Ok(iterate(self.snapshot()))
    }

    fn scan_by_batch(&self, batch_id: &BatchId) -> Result<RecordScan<'_>, StoreError> {
        let matching = self
            .snapshot()
            .into_iter()
            .filter(|b| &b.batch_id == batch_id)
            .collect();
        Ok(iterate(matching))
    }

    fn batch_summaries(&self) -> Result<Vec<BatchSummary>, StoreError> {
        Ok(self
            .snapshot()
            .iter()
            .filter_map(|b| {
                let first = b.records.iter().map(|r| r.ingested_at).min()?;
                let last = b.records.iter().map(|r| r.ingested_at).max()?;
                Some(BatchSummary {
                    batch_id: b.batch_id.clone(),
                    record_count: b.records.len(),
                    first_ingested_at: first,
                    last_ingested_at: last,
                })
            })
            .collect())
    }
}
