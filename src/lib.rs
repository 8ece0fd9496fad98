//! Trial Stability Library
//!
//! Batch transform from raw clinical-trial registry snapshots to per-sponsor
//! early-stop metrics:
//!
//! ```text
//! BatchStore -> select_latest -> normalize_batch -> aggregate -> GuardrailValidator -> MetricsPublisher
//! ```

pub mod aggregate;
pub mod config;
pub mod guardrail;
pub mod ingest;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod publish;
pub mod selector;
pub mod store;

pub use aggregate::{aggregate, CohortFilter};
pub use config::PipelineConfig;
pub use guardrail::{GuardrailPolicy, GuardrailValidator, GuardrailViolation, ValidationReport};
pub use models::{BatchId, NormalizedTrial, OverallStatus, RawRecord, SponsorMetric};
pub use normalize::{normalize, normalize_batch, NormalizedBatch};
pub use pipeline::{Pipeline, PipelineError, RunReport, RunStatus};
pub use publish::{MemoryPublisher, MetricsPublisher, SqlitePublisher};
pub use selector::{latest_batch, select_latest};
pub use store::{BatchStore, BatchWriter, MemoryBatchStore, SqliteBatchStore, StoreError};
