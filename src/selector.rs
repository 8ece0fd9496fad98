//! Latest batch selection.
//!
//! "Latest" is recomputed from committed batch metadata on every call;
//! nothing remembers a current batch between runs, and payloads are never
//! decoded to make the choice.

use crate::models::{BatchId, RawRecord};
use crate::store::{BatchStore, StoreError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

pub use crate::store::BatchSummary;

/// Batch with the greatest max ingestion timestamp; ties go to the
/// lexicographically greatest batch id. `None` for an empty input.
pub fn latest_batch<'a>(records: impl IntoIterator<Item = &'a RawRecord>) -> Option<BatchId> {
    let mut max_ts: HashMap<&'a BatchId, DateTime<Utc>> = HashMap::new();
    for record in records {
        max_ts
            .entry(&record.batch_id)
            .and_modify(|ts| *ts = (*ts).max(record.ingested_at))
            .or_insert(record.ingested_at);
    }
    pick_latest(max_ts.into_iter().map(|(id, ts)| (id.clone(), ts)))
}

fn pick_latest(candidates: impl Iterator<Item = (BatchId, DateTime<Utc>)>) -> Option<BatchId> {
    candidates
        .max_by(|(a_id, a_ts), (b_id, b_ts)| a_ts.cmp(b_ts).then_with(|| a_id.cmp(b_id)))
        .map(|(id, _)| id)
}

/// Select the authoritative batch from committed batch metadata.
pub fn select_latest(store: &dyn BatchStore) -> Result<Option<BatchId>, StoreError> {
    let latest = pick_latest(
        store
            .batch_summaries()?
            .into_iter()
            .map(|s| (s.batch_id, s.last_ingested_at)),
    );
    match &latest {
        Some(id) => debug!("Latest batch: {}", id),
        None => debug!("Store is empty, no batch selected"),
    }
    Ok(latest)
}

/// Summaries for every committed batch, newest first (same order as selection).
pub fn summarize_batches(store: &dyn BatchStore) -> Result<Vec<BatchSummary>, StoreError> {
    let mut summaries = store.batch_summaries()?;
    summaries.sort_by(|a, b| {
        b.last_ingested_at
            .cmp(&a.last_ingested_at)
            .then_with(|| b.batch_id.cmp(&a.batch_id))
    });
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBatchStore;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn rec(batch: &str, secs: i64) -> RawRecord {
        RawRecord::new(BatchId::from(batch), ts(secs), json!({}))
    }

    #[test]
    fn test_picks_batch_with_greatest_timestamp() {
        let records = vec![rec("A", 1), rec("B", 5), rec("C", 3)];
        assert_eq!(latest_batch(&records), Some(BatchId::from("B")));
    }

    #[test]
    fn test_uses_max_timestamp_within_each_batch() {
        // A started earlier but its last row landed after all of B's rows
        let records = vec![rec("A", 1), rec("B", 4), rec("A", 6), rec("B", 5)];
        assert_eq!(latest_batch(&records), Some(BatchId::from("A")));
    }

    #[test]
    fn test_tie_breaks_on_greatest_batch_id() {
        let records = vec![rec("batch_a", 7), rec("batch_c", 7), rec("batch_b", 7)];
        assert_eq!(latest_batch(&records), Some(BatchId::from("batch_c")));
    }

    #[test]
    fn test_empty_input_selects_nothing() {
        assert_eq!(latest_batch(&Vec::<RawRecord>::new()), None);
        let store = MemoryBatchStore::new();
        assert_eq!(select_latest(&store).unwrap(), None);
    }

    #[test]
    fn test_select_latest_from_store() {
        let store = MemoryBatchStore::new();
        store.append_batch(vec![rec("A", 1)]).unwrap();
        store.append_batch(vec![rec("B", 5), rec("B", 2)]).unwrap();
        store.append_batch(vec![rec("C", 3)]).unwrap();
        assert_eq!(select_latest(&store).unwrap(), Some(BatchId::from("B")));

        let summaries = summarize_batches(&store).unwrap();
        let order: Vec<&str> = summaries.iter().map(|s| s.batch_id.as_str()).collect();
        assert_eq!(order, vec!["B", "C", "A"]);
        assert_eq!(summaries[0].record_count, 2);
        assert_eq!(summaries[0].first_ingested_at, ts(2));
    }
}
