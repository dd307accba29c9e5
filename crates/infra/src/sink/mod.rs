//! Result & Alert Sink: durable store for predictions, alerts and evaluation cursors.
//!
//! ## Semantics
//!
//! - Predictions are keyed by `(item, horizon_start, horizon_end, produced_at)`;
//!   writing the same key twice overwrites with identical content, so a re-executed
//!   PREDICT job leaves exactly the set a clean run would.
//! - Older runs are kept as history; "latest" is the newest `produced_at` per item/horizon.
//! - Alerts are reconciled through the dedup rule (one open record per dedup key).
//! - Evaluation cursors only move forward.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryResultSink;
pub use postgres::PostgresResultSink;

use chrono::{DateTime, Utc};

use shoptrack_ai::PredictionRecord;
use shoptrack_alerts::{
    AlertCandidate, AlertFilter, AlertRecord, AlertStats, Cursors, OperationalAlert, Resolution,
    UpsertOutcome,
};
use shoptrack_core::{AlertId, ItemId, PipelineResult};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PredictionQuery {
    pub item_id: Option<ItemId>,
    /// Horizon length in seconds.
    pub horizon_secs: Option<i64>,
}

impl PredictionQuery {
    pub fn matches(&self, record: &PredictionRecord) -> bool {
        self.item_id.as_ref().is_none_or(|i| &record.item_id == i)
            && self.horizon_secs.is_none_or(|h| record.horizon_secs() == h)
    }
}

pub trait ResultSink: Send + Sync {
    /// Idempotent upsert of a batch of prediction records. Returns how many were written.
    fn put_predictions(&self, records: &[PredictionRecord]) -> PipelineResult<usize>;

    /// Newest record per item/horizon matching the query.
    fn latest_predictions(&self, query: &PredictionQuery) -> PipelineResult<Vec<PredictionRecord>>;

    /// Every stored record matching the query, newest first.
    fn prediction_history(
        &self,
        query: &PredictionQuery,
        limit: usize,
    ) -> PipelineResult<Vec<PredictionRecord>>;

    fn upsert_alert(&self, candidate: AlertCandidate) -> PipelineResult<UpsertOutcome>;

    fn get_alert(&self, id: AlertId) -> PipelineResult<Option<AlertRecord>>;

    fn list_alerts(&self, filter: &AlertFilter) -> PipelineResult<Vec<AlertRecord>>;

    /// `None` if the alert does not exist.
    fn acknowledge_alert(
        &self,
        id: AlertId,
        by: Option<String>,
        at: DateTime<Utc>,
    ) -> PipelineResult<Option<AlertRecord>>;

    /// Resolve or dismiss an alert; the first closure is kept. `None` if it does not exist.
    fn close_alert(
        &self,
        id: AlertId,
        resolution: Resolution,
        by: Option<String>,
        at: DateTime<Utc>,
    ) -> PipelineResult<Option<AlertRecord>>;

    /// Mark alerts whose `expires_at` passed. Returns how many changed.
    fn expire_alerts(&self, now: DateTime<Utc>) -> PipelineResult<usize>;

    fn alert_stats(&self) -> PipelineResult<AlertStats>;

    fn raise_operational(&self, alert: OperationalAlert) -> PipelineResult<()>;

    /// Newest first.
    fn list_operational(&self, limit: usize) -> PipelineResult<Vec<OperationalAlert>>;

    fn evaluation_cursors(&self) -> PipelineResult<Cursors>;

    /// Move cursors forward; a position older than the stored one is ignored.
    fn advance_cursors(&self, advanced: &Cursors) -> PipelineResult<()>;
}
