use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use shoptrack_ai::PredictionRecord;
use shoptrack_alerts::{
    AlertCandidate, AlertFilter, AlertLedger, AlertRecord, AlertStats, Cursors, OperationalAlert,
    Resolution, UpsertOutcome,
};
use shoptrack_core::error::poisoned;
use shoptrack_core::{AlertId, ItemId, PipelineResult};

use super::{PredictionQuery, ResultSink};

type PredictionKey = (ItemId, DateTime<Utc>, DateTime<Utc>, DateTime<Utc>);

fn key_of(r: &PredictionRecord) -> PredictionKey {
    (r.item_id.clone(), r.horizon_start, r.horizon_end, r.produced_at)
}

/// In-memory sink for tests/dev and the database-less binary.
#[derive(Debug)]
pub struct InMemoryResultSink {
    predictions: RwLock<BTreeMap<PredictionKey, PredictionRecord>>,
    alerts: RwLock<AlertLedger>,
    operational: RwLock<Vec<OperationalAlert>>,
    cursors: RwLock<Cursors>,
}

impl InMemoryResultSink {
    pub fn new(alert_ttl: std::time::Duration) -> Self {
        let ttl = chrono::Duration::from_std(alert_ttl).unwrap_or(chrono::Duration::hours(24));
        Self {
            predictions: RwLock::new(BTreeMap::new()),
            alerts: RwLock::new(AlertLedger::new(ttl)),
            operational: RwLock::new(Vec::new()),
            cursors: RwLock::new(Cursors::new()),
        }
    }

    /// Number of stored prediction records (all runs).
    pub fn prediction_count(&self) -> PipelineResult<usize> {
        Ok(self.predictions.read().map_err(poisoned)?.len())
    }
}

impl ResultSink for InMemoryResultSink {
    fn put_predictions(&self, records: &[PredictionRecord]) -> PipelineResult<usize> {
        let mut predictions = self.predictions.write().map_err(poisoned)?;
        for r in records {
            predictions.insert(key_of(r), r.clone());
        }
        Ok(records.len())
    }

    fn latest_predictions(&self, query: &PredictionQuery) -> PipelineResult<Vec<PredictionRecord>> {
        let predictions = self.predictions.read().map_err(poisoned)?;
        let mut latest: BTreeMap<(ItemId, i64), &PredictionRecord> = BTreeMap::new();
        for r in predictions.values().filter(|r| query.matches(r)) {
            let slot = latest.entry((r.item_id.clone(), r.horizon_secs())).or_insert(r);
            if r.produced_at > slot.produced_at {
                *slot = r;
            }
        }
        Ok(latest.into_values().cloned().collect())
    }

    fn prediction_history(
        &self,
        query: &PredictionQuery,
        limit: usize,
    ) -> PipelineResult<Vec<PredictionRecord>> {
        let predictions = self.predictions.read().map_err(poisoned)?;
        let mut out: Vec<PredictionRecord> =
            predictions.values().filter(|r| query.matches(r)).cloned().collect();
        out.sort_by(|a, b| {
            b.produced_at
                .cmp(&a.produced_at)
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        out.truncate(limit);
        Ok(out)
    }

    fn upsert_alert(&self, candidate: AlertCandidate) -> PipelineResult<UpsertOutcome> {
        Ok(self.alerts.write().map_err(poisoned)?.upsert(candidate))
    }

    fn get_alert(&self, id: AlertId) -> PipelineResult<Option<AlertRecord>> {
        Ok(self.alerts.read().map_err(poisoned)?.get(id).cloned())
    }

    fn list_alerts(&self, filter: &AlertFilter) -> PipelineResult<Vec<AlertRecord>> {
        Ok(self.alerts.read().map_err(poisoned)?.list(filter))
    }

    fn acknowledge_alert(
        &self,
        id: AlertId,
        by: Option<String>,
        at: DateTime<Utc>,
    ) -> PipelineResult<Option<AlertRecord>> {
        Ok(self.alerts.write().map_err(poisoned)?.acknowledge(id, by, at))
    }

    fn close_alert(
        &self,
        id: AlertId,
        resolution: Resolution,
        by: Option<String>,
        at: DateTime<Utc>,
    ) -> PipelineResult<Option<AlertRecord>> {
        Ok(self.alerts.write().map_err(poisoned)?.close(id, resolution, by, at))
    }

    fn expire_alerts(&self, now: DateTime<Utc>) -> PipelineResult<usize> {
        Ok(self.alerts.write().map_err(poisoned)?.expire_due(now))
    }

    fn alert_stats(&self) -> PipelineResult<AlertStats> {
        Ok(self.alerts.read().map_err(poisoned)?.stats())
    }

    fn raise_operational(&self, alert: OperationalAlert) -> PipelineResult<()> {
        self.operational.write().map_err(poisoned)?.push(alert);
        Ok(())
    }

    fn list_operational(&self, limit: usize) -> PipelineResult<Vec<OperationalAlert>> {
        let ops = self.operational.read().map_err(poisoned)?;
        Ok(ops.iter().rev().take(limit).cloned().collect())
    }

    fn evaluation_cursors(&self) -> PipelineResult<Cursors> {
        Ok(self.cursors.read().map_err(poisoned)?.clone())
    }

    fn advance_cursors(&self, advanced: &Cursors) -> PipelineResult<()> {
        let mut cursors = self.cursors.write().map_err(poisoned)?;
        for (key, at) in advanced {
            let slot = cursors.entry(key.clone()).or_insert(*at);
            if *at > *slot {
                *slot = *at;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use shoptrack_alerts::CursorKey;
    use shoptrack_core::ModelVersion;

    fn t(h: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap() + chrono::Duration::hours(h)
    }

    fn rec(item: &str, produced: i64, score: f64) -> PredictionRecord {
        PredictionRecord {
            item_id: ItemId::new(item),
            horizon_start: t(produced),
            horizon_end: t(produced + 24),
            score,
            expected_demand: 1.0,
            confidence: 0.5,
            produced_by_model_version: ModelVersion(1),
            produced_at: t(produced),
        }
    }

    fn sink() -> InMemoryResultSink {
        InMemoryResultSink::new(std::time::Duration::from_secs(24 * 3600))
    }

    #[test]
    fn rewriting_a_run_is_idempotent() {
        let sink = sink();
        let run = vec![rec("a", 0, 0.1), rec("b", 0, 0.2)];
        sink.put_predictions(&run).unwrap();
        sink.put_predictions(&run).unwrap();
        assert_eq!(sink.prediction_count().unwrap(), 2);
    }

    #[test]
    fn latest_prefers_newest_run_and_keeps_history() {
        let sink = sink();
        sink.put_predictions(&[rec("a", 1, 0.3)]).unwrap();
        // An older run arriving late does not displace the newer one.
        sink.put_predictions(&[rec("a", 0, 0.9)]).unwrap();

        let latest = sink.latest_predictions(&PredictionQuery::default()).unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].produced_at, t(1));

        let history = sink
            .prediction_history(
                &PredictionQuery {
                    item_id: Some(ItemId::new("a")),
                    horizon_secs: None,
                },
                10,
            )
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].produced_at, t(1));
    }

    #[test]
    fn resolved_alert_is_listed_by_its_status() {
        use shoptrack_alerts::{AlertKind, AlertStatus, DedupKey, Severity, TimeBucket};

        let sink = sink();
        let candidate = AlertCandidate {
            dedup_key: DedupKey::new(ItemId::new("a"), AlertKind::LowStock, TimeBucket(0)),
            severity: Severity::High,
            observed_at: t(0),
            message: "a low".into(),
            score: None,
            stock: Some(2),
        };
        let id = sink.upsert_alert(candidate).unwrap().record().id;

        let closed = sink
            .close_alert(id, Resolution::Resolved, Some("ops".into()), t(1))
            .unwrap()
            .unwrap();
        assert_eq!(closed.status(), AlertStatus::Resolved);
        let resolved = sink
            .list_alerts(&AlertFilter {
                status: Some(AlertStatus::Resolved),
                ..AlertFilter::default()
            })
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(sink.expire_alerts(t(48)).unwrap(), 0);
        assert!(sink
            .close_alert(AlertId::new(), Resolution::Dismissed, None, t(1))
            .unwrap()
            .is_none());
    }

    #[test]
    fn cursors_only_move_forward() {
        let sink = sink();
        let key = CursorKey::for_record(&rec("a", 0, 0.1));
        let mut adv = Cursors::new();
        adv.insert(key.clone(), t(5));
        sink.advance_cursors(&adv).unwrap();
        adv.insert(key.clone(), t(2));
        sink.advance_cursors(&adv).unwrap();
        assert_eq!(sink.evaluation_cursors().unwrap().get(&key), Some(&t(5)));
    }
}
