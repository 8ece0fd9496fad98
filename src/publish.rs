//! Metric Publication
//!
//! A passing run replaces the published normalized view and metric table
//! wholesale. Both tables are rewritten in one transaction, so readers see
//! either the previous run or the new one, never a mix.
//!
//! # Schema
//!
//! ```sql
//! stg_ctgov_studies(nct_id, brief_title, overall_status, first_submitted_date,
//!                   study_type, phases_json, sponsor_class, has_results)
//! fct_clinical_trial_early_stops(sponsor_class, early_stop_trials,
//!                                closed_trials, early_stop_rate)
//! pipeline_runs(id, batch_id, published_at_us, ...)   -- append-only history
//! ```

use crate::models::{BatchId, NormalizedTrial, SponsorMetric};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OpenFlags};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const PUBLISH_SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS stg_ctgov_studies (
    nct_id TEXT NOT NULL,
    brief_title TEXT,
    overall_status TEXT,
    first_submitted_date TEXT,
    study_type TEXT,
    phases_json TEXT NOT NULL,
    sponsor_class TEXT,
    has_results INTEGER
);

CREATE TABLE IF NOT EXISTS fct_clinical_trial_early_stops (
    sponsor_class TEXT PRIMARY KEY,
    early_stop_trials INTEGER NOT NULL,
    closed_trials INTEGER NOT NULL,
    early_stop_rate REAL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS pipeline_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    batch_id TEXT,
    published_at_us INTEGER NOT NULL,
    trials INTEGER NOT NULL,
    metric_rows INTEGER NOT NULL,
    dropped_missing_id INTEGER NOT NULL
);
"#;

/// Everything a passing run publishes.
#[derive(Debug, Clone)]
pub struct PublishedRun<'a> {
    pub batch_id: Option<&'a BatchId>,
    pub trials: &'a [NormalizedTrial],
    pub metrics: &'a [SponsorMetric],
    pub dropped_missing_id: u64,
    pub published_at: DateTime<Utc>,
}

/// Destination for validated output.
pub trait MetricsPublisher: Send + Sync {
    /// Replace the published view and metric table with this run's output.
    fn publish(&self, run: &PublishedRun<'_>) -> Result<(), PublishError>;

    /// Currently published metric rows, sorted by sponsor class.
    fn published_metrics(&self) -> Result<Vec<SponsorMetric>, PublishError>;

    /// Published rows whose rate is defined and outside [0, 1].
    fn out_of_range_rows(&self) -> Result<Vec<SponsorMetric>, PublishError>;
}

/// SQLite-backed publisher; usually shares the batch store's database file.
pub struct SqlitePublisher {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePublisher {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, PublishError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags)?;
        Self::from_connection(conn)
    }

    /// In-memory database (for testing).
    pub fn in_memory() -> Result<Self, PublishError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, PublishError> {
        conn.execute_batch(PUBLISH_SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Number of published runs recorded so far.
    pub fn run_count(&self) -> Result<u64, PublishError> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM pipeline_runs", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Number of rows in the published normalized view.
    pub fn published_trial_count(&self) -> Result<u64, PublishError> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM stg_ctgov_studies", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    fn query_metrics(&self, sql: &str) -> Result<Vec<SponsorMetric>, PublishError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| {
            Ok(SponsorMetric {
                sponsor_class: row.get(0)?,
                early_stop_count: row.get::<_, i64>(1)? as u64,
                closed_count: row.get::<_, i64>(2)? as u64,
                early_stop_rate: row.get(3)?,
            })
        })?;
        let metrics = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(metrics)
    }
}

impl MetricsPublisher for SqlitePublisher {
    fn publish(&self, run: &PublishedRun<'_>) -> Result<(), PublishError> {
        let trial_rows = run
            .trials
            .iter()
            .map(|t| Ok((t, serde_json::to_string(&t.phases)?)))
            .collect::<Result<Vec<_>, PublishError>>()?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM stg_ctgov_studies", [])?;
        tx.execute("DELETE FROM fct_clinical_trial_early_stops", [])?;

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO stg_ctgov_studies
                 (nct_id, brief_title, overall_status, first_submitted_date, study_type,
                  phases_json, sponsor_class, has_results)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for (t, phases_json) in &trial_rows {
                let Some(nct_id) = t.nct_id.as_deref() else {
                    continue;
                };
                stmt.execute(params![
                    nct_id,
                    t.brief_title,
                    t.overall_status.as_ref().map(|s| s.as_str()),
                    t.first_submitted_date.map(|d| d.format("%Y-%m-%d").to_string()),
                    t.study_type,
                    phases_json,
                    t.sponsor_class,
                    t.has_results,
                ])?;
            }
        }

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO fct_clinical_trial_early_stops
                 (sponsor_class, early_stop_trials, closed_trials, early_stop_rate)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for m in run.metrics {
                stmt.execute(params![
                    m.sponsor_class,
                    m.early_stop_count as i64,
                    m.closed_count as i64,
                    m.early_stop_rate,
                ])?;
            }
        }

        tx.execute(
            "INSERT INTO pipeline_runs (batch_id, published_at_us, trials, metric_rows, dropped_missing_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run.batch_id.map(|b| b.as_str()),
                run.published_at.timestamp_micros(),
                run.trials.len() as i64,
                run.metrics.len() as i64,
                run.dropped_missing_id as i64,
            ],
        )?;
        tx.commit()?;

        info!(
            "Published {} trials and {} metric rows",
            run.trials.len(),
            run.metrics.len()
        );
        Ok(())
    }

    fn published_metrics(&self) -> Result<Vec<SponsorMetric>, PublishError> {
        self.query_metrics(
            "SELECT sponsor_class, early_stop_trials, closed_trials, early_stop_rate
             FROM fct_clinical_trial_early_stops ORDER BY sponsor_class",
        )
    }

    fn out_of_range_rows(&self) -> Result<Vec<SponsorMetric>, PublishError> {
        self.query_metrics(
            "SELECT sponsor_class, early_stop_trials, closed_trials, early_stop_rate
             FROM fct_clinical_trial_early_stops
             WHERE early_stop_rate IS NOT NULL AND (early_stop_rate < 0 OR early_stop_rate > 1)
             ORDER BY sponsor_class",
        )
    }
}

/// Outcome of checking the published metric table.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// Every defined rate lies in [0, 1].
    Clean { rows: usize },
    /// Rows whose rate is defined and outside [0, 1].
    OutOfRange(Vec<SponsorMetric>),
    /// The metric table is empty; there is nothing to validate.
    NothingPublished,
}

/// Check the currently published metrics.
pub fn check_published(publisher: &dyn MetricsPublisher) -> Result<CheckOutcome, PublishError> {
    let rows = publisher.published_metrics()?.len();
    if rows == 0 {
        return Ok(CheckOutcome::NothingPublished);
    }
    let bad = publisher.out_of_range_rows()?;
    if bad.is_empty() {
        Ok(CheckOutcome::Clean { rows })
    } else {
        Ok(CheckOutcome::OutOfRange(bad))
    }
}

/// Keeps the last published output in memory.
#[derive(Default)]
pub struct MemoryPublisher {
    published: RwLock<Option<(Vec<NormalizedTrial>, Vec<SponsorMetric>)>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_published(&self) -> bool {
        self.published.read().is_some()
    }

    pub fn published_trials(&self) -> Vec<NormalizedTrial> {
        self.published
            .read()
            .as_ref()
            .map(|(trials, _)| trials.clone())
            .unwrap_or_default()
    }
}

impl MetricsPublisher for MemoryPublisher {
    fn publish(&self, run: &PublishedRun<'_>) -> Result<(), PublishError> {
        *self.published.write() = Some((run.trials.to_vec(), run.metrics.to_vec()));
        Ok(())
    }

    fn published_metrics(&self) -> Result<Vec<SponsorMetric>, PublishError> {
        Ok(self
            .published
            .read()
            .as_ref()
            .map(|(_, metrics)| metrics.clone())
            .unwrap_or_default())
    }

    fn out_of_range_rows(&self) -> Result<Vec<SponsorMetric>, PublishError> {
        let metrics = self.published_metrics()?;
        Ok(crate::guardrail::out_of_range_rows(&metrics)
            .into_iter()
            .cloned()
            .collect())
    }
}

#[derive(Debug)]
pub enum PublishError {
    Sqlite(rusqlite::Error),
    Serialization(serde_json::Error),
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(e) => write!(f, "SQLite error: {}", e),
            Self::Serialization(e) => write!(f, "Serialization error: {}", e),
        }
    }
}

impl std::error::Error for PublishError {}

impl From<rusqlite::Error> for PublishError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

impl From<serde_json::Error> for PublishError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OverallStatus;

    fn trial(id: &str) -> NormalizedTrial {
        NormalizedTrial {
            nct_id: Some(id.to_string()),
            brief_title: Some("t".to_string()),
            overall_status: Some(OverallStatus::Completed),
            first_submitted_date: chrono::NaiveDate::from_ymd_opt(2020, 1, 2),
            study_type: Some("INTERVENTIONAL".to_string()),
            phases: vec!["PHASE2".to_string()],
            sponsor_class: None,
            has_results: None,
        }
    }

    fn run<'a>(trials: &'a [NormalizedTrial], metrics: &'a [SponsorMetric]) -> PublishedRun<'a> {
        PublishedRun {
            batch_id: None,
            trials,
            metrics,
            dropped_missing_id: 0,
            published_at: Utc::now(),
        }
    }

    #[test]
    fn test_publish_replaces_previous_output() {
        let publisher = SqlitePublisher::in_memory().unwrap();

        let trials = vec![trial("NCT1"), trial("NCT2")];
        let metrics = vec![
            SponsorMetric::from_counts("OTHER", 0, 0),
            SponsorMetric::from_counts("INDUSTRY", 1, 2),
        ];
        publisher.publish(&run(&trials, &metrics)).unwrap();
        assert_eq!(publisher.published_trial_count().unwrap(), 2);

        let published = publisher.published_metrics().unwrap();
        assert_eq!(published[0].sponsor_class, "INDUSTRY");
        assert_eq!(published[0].early_stop_rate, Some(0.5));
        assert_eq!(published[1].early_stop_rate, None);

        let trials = vec![trial("NCT9")];
        let metrics = vec![SponsorMetric::from_counts("NIH", 0, 1)];
        publisher.publish(&run(&trials, &metrics)).unwrap();
        assert_eq!(publisher.published_trial_count().unwrap(), 1);
        assert_eq!(publisher.published_metrics().unwrap(), metrics);
        assert_eq!(publisher.run_count().unwrap(), 2);
    }

    #[test]
    fn test_out_of_range_query() {
        let publisher = SqlitePublisher::in_memory().unwrap();
        let metrics = vec![
            SponsorMetric::from_counts("INDUSTRY", 1, 2),
            SponsorMetric {
                sponsor_class: "BROKEN".to_string(),
                early_stop_count: 3,
                closed_count: 2,
                early_stop_rate: Some(1.5),
            },
            SponsorMetric::from_counts("OTHER", 0, 0),
        ];
        publisher.publish(&run(&[], &metrics)).unwrap();

        let bad = publisher.out_of_range_rows().unwrap();
        assert_eq!(bad.len(), 1);
        assert_eq!(bad[0].sponsor_class, "BROKEN");
    }

    #[test]
    fn test_memory_publisher() {
        let publisher = MemoryPublisher::new();
        assert!(!publisher.is_published());
        let trials = vec![trial("NCT1")];
        let metrics = vec![SponsorMetric::from_counts("NIH", 1, 1)];
        publisher.publish(&run(&trials, &metrics)).unwrap();
        assert!(publisher.is_published());
        assert_eq!(publisher.published_trials().len(), 1);
        assert!(publisher.out_of_range_rows().unwrap().is_empty());
    }

    #[test]
    fn test_check_outcomes() {
        let publisher = SqlitePublisher::in_memory().unwrap();
        assert_eq!(check_published(&publisher).unwrap(), CheckOutcome::NothingPublished);

        let metrics = vec![SponsorMetric::from_counts("NIH", 1, 4)];
        publisher.publish(&run(&[], &metrics)).unwrap();
        assert_eq!(check_published(&publisher).unwrap(), CheckOutcome::Clean { rows: 1 });

        let broken = SponsorMetric {
            sponsor_class: "BROKEN".to_string(),
            early_stop_count: 2,
            closed_count: 1,
            early_stop_rate: Some(2.0),
        };
        publisher.publish(&run(&[], std::slice::from_ref(&broken))).unwrap();
        assert_eq!(
            check_published(&publisher).unwrap(),
            CheckOutcome::OutOfRange(vec![broken])
        );
    }

    #[test]
    fn test_empty_publication_cannot_be_checked() {
        let publisher = MemoryPublisher::new();
        publisher.publish(&run(&[], &[])).unwrap();
        assert!(publisher.is_published());
        assert_eq!(check_published(&publisher).unwrap(), CheckOutcome::NothingPublished);
    }
}
