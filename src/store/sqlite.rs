//! SQLite Batch Store
//!
//! Raw documents live in `raw_ctgov_studies`; a batch is visible only once its
//! row exists in `batch_commits`. Rows and the commit marker are written in a
//! single transaction, so readers never see a partially written batch.
//!
//! Scans page through rowids (keyset pagination) instead of loading the whole
//! table, so memory stays bounded by the page size.

use super::{check_well_formed, BatchCommit, BatchStore, BatchSummary, RecordScan, StoreError};
use crate::models::{BatchId, RawRecord};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

pub const DEFAULT_SCAN_PAGE_SIZE: usize = 500;

const BATCH_STORE_SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -16000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS raw_ctgov_studies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    raw_data TEXT NOT NULL,
    ingestion_ts_us INTEGER NOT NULL,
    batch_id TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_raw_ctgov_studies_batch
    ON raw_ctgov_studies(batch_id, id);

-- Commit marker: a batch without a row here is invisible to readers
CREATE TABLE IF NOT EXISTS batch_commits (
    batch_id TEXT PRIMARY KEY,
    record_count INTEGER NOT NULL,
    committed_at_us INTEGER NOT NULL
) WITHOUT ROWID;
"#;

/// Durable batch store backed by a SQLite file.
pub struct SqliteBatchStore {
    conn: Arc<Mutex<Connection>>,
    page_size: usize,
}

impl SqliteBatchStore {
    /// Open or create the store at `db_path`.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.exists() && !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)?;
        let store = Self::from_connection(conn)?;
        info!("Batch store opened at {}", path.display());
        Ok(store)
    }

    /// In-memory database (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(BATCH_STORE_SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            page_size: DEFAULT_SCAN_PAGE_SIZE,
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Number of committed batches.
    pub fn batch_count(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM batch_commits", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn scan(&self, batch: Option<BatchId>) -> RecordScan<'static> {
        Box::new(SqliteScan {
            conn: Arc::clone(&self.conn),
            batch,
            after_id: 0,
            page_size: self.page_size,
            buffer: VecDeque::new(),
            exhausted: false,
        })
    }
}

impl BatchStore for SqliteBatchStore {
    fn append_batch(&self, records: Vec<RawRecord>) -> Result<BatchCommit, StoreError> {
        let batch_id = check_well_formed(&records)?;

        // Serialize outside the lock
        let rows = records
            .iter()
            .map(|r| Ok((serde_json::to_string(&r.payload)?, r.ingested_at.timestamp_micros())))
            .collect::<Result<Vec<(String, i64)>, StoreError>>()?;

        let committed_at = Utc::now();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM batch_commits WHERE batch_id = ?1)",
            params![batch_id.as_str()],
            |row| row.get(0),
        )?;
        if exists {
            return Err(StoreError::BatchAlreadyCommitted(batch_id));
        }

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO raw_ctgov_studies (raw_data, ingestion_ts_us, batch_id)
                 VALUES (?1, ?2, ?3)",
            )?;
            for (raw_data, ts_us) in &rows {
                stmt.execute(params![raw_data, ts_us, batch_id.as_str()])?;
            }
        }

        tx.execute(
            "INSERT INTO batch_commits (batch_id, record_count, committed_at_us) VALUES (?1, ?2, ?3)",
            params![batch_id.as_str(), rows.len() as i64, committed_at.timestamp_micros()],
        )?;
        tx.commit()?;

        info!("Committed batch {} ({} records)", batch_id, rows.len());
        Ok(BatchCommit {
            batch_id,
            record_count: rows.len(),
            committed_at,
        })
    }

    fn scan_all(&self) -> Result<RecordScan<'_>, StoreError> {
        Ok(self.scan(None))
    }

    fn scan_by_batch(&self, batch_id: &BatchId) -> Result<RecordScan<'_>, StoreError> {
        Ok(self.scan(Some(batch_id.clone())))
    }

    fn batch_summaries(&self) -> Result<Vec<BatchSummary>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT r.batch_id, COUNT(*), MIN(r.ingestion_ts_us), MAX(r.ingestion_ts_us)
             FROM raw_ctgov_studies r
             JOIN batch_commits c ON c.batch_id = r.batch_id
             GROUP BY r.batch_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let micros = |ts_us: i64| {
            DateTime::<Utc>::from_timestamp_micros(ts_us).ok_or(StoreError::InvalidTimestamp(ts_us))
        };
        let mut summaries = Vec::with_capacity(rows.len());
        for (batch_id, count, first_us, last_us) in rows {
            summaries.push(BatchSummary {
                batch_id: BatchId::new(batch_id),
                record_count: count as usize,
                first_ingested_at: micros(first_us)?,
                last_ingested_at: micros(last_us)?,
            });
        }
        Ok(summaries)
    }
}

struct SqliteScan {
    conn: Arc<Mutex<Connection>>,
    batch: Option<BatchId>,
    after_id: i64,
    page_size: usize,
    buffer: VecDeque<RawRecord>,
    exhausted: bool,
}

impl SqliteScan {
    fn fetch_page(&mut self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT r.id, r.raw_data, r.ingestion_ts_us, r.batch_id
             FROM raw_ctgov_studies r
             JOIN batch_commits c ON c.batch_id = r.batch_id
             WHERE r.id > ?1",
        );
        if self.batch.is_some() {
            sql.push_str(" AND r.batch_id = ?3");
        }
        sql.push_str(" ORDER BY r.id LIMIT ?2");

        let mut stmt = conn.prepare_cached(&sql)?;
        let limit = self.page_size as i64;
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(i64, String, i64, String)> {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        };
        let rows = match &self.batch {
            Some(batch) => stmt
                .query_map(params![self.after_id, limit, batch.as_str()], map_row)?
                .collect::<Result<Vec<_>, _>>()?,
            None => stmt
                .query_map(params![self.after_id, limit], map_row)?
                .collect::<Result<Vec<_>, _>>()?,
        };

        if rows.len() < self.page_size {
            self.exhausted = true;
        }
        debug!("Scanned page of {} rows after id {}", rows.len(), self.after_id);

        for (id, raw_data, ts_us, batch_id) in rows {
            self.after_id = id;
            let batch_id = BatchId::new(batch_id);
            let payload = serde_json::from_str(&raw_data).map_err(|e| StoreError::CorruptPayload {
                batch_id: batch_id.clone(),
                reason: e.to_string(),
            })?;
            let ingested_at =
                DateTime::<Utc>::from_timestamp_micros(ts_us).ok_or(StoreError::InvalidTimestamp(ts_us))?;
            self.buffer.push_back(RawRecord {
                payload,
                ingested_at,
                batch_id,
            });
        }
        Ok(())
    }
}

impl Iterator for SqliteScan {
    type Item = Result<RawRecord, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                self.buffer.clear();
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BatchWriter;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_round_trip_preserves_payload_and_timestamp() {
        let store = SqliteBatchStore::in_memory().unwrap();
        let at = Utc.timestamp_opt(1_700_000_000, 123_456_000).unwrap();
        let payload = json!({"protocolSection": {"identificationModule": {"nctId": "NCT01"}}});
        store
            .append_batch(vec![RawRecord::new(BatchId::from("b1"), at, payload.clone())])
            .unwrap();

        let records: Vec<_> = store.scan_all().unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, payload);
        assert_eq!(records[0].ingested_at, at);
        assert_eq!(records[0].batch_id.as_str(), "b1");
    }

    #[test]
    fn test_scan_pages_through_all_rows_in_order() {
        let store = SqliteBatchStore::in_memory().unwrap().with_page_size(3);
        let mut writer = BatchWriter::new(&store, BatchId::from("b1"));
        for i in 0..10 {
            writer.append(json!({ "i": i }), ts(100 + i));
        }
        writer.commit().unwrap();

        let seen: Vec<i64> = store
            .scan_by_batch(&BatchId::from("b1"))
            .unwrap()
            .map(|r| r.unwrap().payload["i"].as_i64().unwrap())
            .collect();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_rejected_batch_leaves_no_rows() {
        let store = SqliteBatchStore::in_memory().unwrap();
        store
            .append_batch(vec![RawRecord::new(BatchId::from("b1"), ts(1), json!({}))])
            .unwrap();
        let err = store
            .append_batch(vec![
                RawRecord::new(BatchId::from("b1"), ts(2), json!({})),
                RawRecord::new(BatchId::from("b1"), ts(3), json!({})),
            ])
            .unwrap_err();
        assert!(matches!(err, StoreError::BatchAlreadyCommitted(_)));
        assert_eq!(store.scan_all().unwrap().count(), 1);
        assert_eq!(store.batch_count().unwrap(), 1);
    }

    #[test]
    fn test_uncommitted_rows_are_invisible() {
        let store = SqliteBatchStore::in_memory().unwrap();
        {
            // Simulate a writer that died between row inserts and the commit marker
            let conn = store.conn.lock();
            conn.execute(
                "INSERT INTO raw_ctgov_studies (raw_data, ingestion_ts_us, batch_id) VALUES ('{}', 1, 'partial')",
                [],
            )
            .unwrap();
        }
        assert_eq!(store.scan_all().unwrap().count(), 0);
        assert_eq!(store.scan_by_batch(&BatchId::from("partial")).unwrap().count(), 0);
    }

    #[test]
    fn test_corrupt_payload_surfaces_as_error() {
        let store = SqliteBatchStore::in_memory().unwrap();
        {
            let conn = store.conn.lock();
            conn.execute_batch(
                "INSERT INTO raw_ctgov_studies (raw_data, ingestion_ts_us, batch_id) VALUES ('{not json', 1, 'bad');
                 INSERT INTO batch_commits (batch_id, record_count, committed_at_us) VALUES ('bad', 1, 1);",
            )
            .unwrap();
        }
        let results: Vec<_> = store.scan_all().unwrap().collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(StoreError::CorruptPayload { .. })));
    }

    #[test]
    fn test_batch_summaries_skip_payload_decoding() {
        let store = SqliteBatchStore::in_memory().unwrap();
        {
            let conn = store.conn.lock();
            conn.execute_batch(
                "INSERT INTO raw_ctgov_studies (raw_data, ingestion_ts_us, batch_id) VALUES ('{not json', 1, 'old');
                 INSERT INTO batch_commits (batch_id, record_count, committed_at_us) VALUES ('old', 1, 1);
                 INSERT INTO raw_ctgov_studies (raw_data, ingestion_ts_us, batch_id) VALUES ('{}', 7, 'partial');",
            )
            .unwrap();
        }
        store
            .append_batch(vec![
                RawRecord::new(BatchId::from("new"), ts(1_700_000_000), json!({})),
                RawRecord::new(BatchId::from("new"), ts(1_700_000_005), json!({})),
            ])
            .unwrap();

        let mut summaries = store.batch_summaries().unwrap();
        summaries.sort_by(|a, b| a.batch_id.cmp(&b.batch_id));
        let ids: Vec<&str> = summaries.iter().map(|s| s.batch_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old"]);
        assert_eq!(summaries[0].record_count, 2);
        assert_eq!(summaries[0].first_ingested_at, ts(1_700_000_000));
        assert_eq!(summaries[0].last_ingested_at, ts(1_700_000_005));
        assert_eq!(summaries[1].last_ingested_at.timestamp_micros(), 1);

        // A corrupt row in an old batch must not block selection
        assert_eq!(
            crate::selector::select_latest(&store).unwrap(),
            Some(BatchId::from("new"))
        );
    }

    #[test]
    fn test_open_creates_file_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("trials.db");
        {
            let store = SqliteBatchStore::open(&path).unwrap();
            store
                .append_batch(vec![RawRecord::new(BatchId::from("b1"), ts(5), json!({"a": 1}))])
                .unwrap();
        }
        let reopened = SqliteBatchStore::open(&path).unwrap();
        assert_eq!(reopened.scan_all().unwrap().count(), 1);
    }
}
