use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use shoptrack_ai::{Partition, PredictionRecord, StockLevels};
use shoptrack_core::{ItemId, ThresholdConfig};

use crate::record::{AlertCandidate, AlertKind, DedupKey, Severity, TimeBucket};

/// Weight of the rush score in the composite risk; the rest is stock pressure.
const SCORE_WEIGHT: f64 = 0.6;

/// Rush scores at or above this escalate from MEDIUM to HIGH.
const RUSH_HIGH_SCORE: f64 = 0.95;

/// Key of the per-item evaluation cursor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CursorKey {
    pub item_id: ItemId,
    pub horizon_secs: i64,
}

impl CursorKey {
    pub fn for_record(record: &PredictionRecord) -> Self {
        Self {
            item_id: record.item_id.clone(),
            horizon_secs: record.horizon_secs(),
        }
    }
}

/// Newest evaluated `produced_at` per item/horizon.
pub type Cursors = BTreeMap<CursorKey, DateTime<Utc>>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub candidates: Vec<AlertCandidate>,
    /// Cursor positions to persist once the candidates are written.
    pub advanced: Cursors,
    /// Records skipped because a newer one was already evaluated.
    pub skipped_stale: usize,
}

/// Share of the expected horizon demand that current stock cannot cover, in [0, 1].
pub fn stock_pressure(stock: Option<i64>, expected_demand: f64) -> f64 {
    match stock {
        Some(stock) if expected_demand > 0.0 => {
            ((expected_demand - stock.max(0) as f64) / expected_demand).clamp(0.0, 1.0)
        }
        _ => 0.0,
    }
}

pub fn composite_risk(score: f64, pressure: f64) -> f64 {
    SCORE_WEIGHT * score + (1.0 - SCORE_WEIGHT) * pressure
}

/// Turns prediction records and stock levels into alert candidates.
#[derive(Debug, Clone)]
pub struct AlertEvaluator {
    dedup_window: Duration,
}

impl AlertEvaluator {
    pub fn new(dedup_window: Duration) -> Self {
        Self { dedup_window }
    }

    pub fn dedup_window(&self) -> Duration {
        self.dedup_window
    }

    fn key(&self, item_id: &ItemId, kind: AlertKind, at: DateTime<Utc>) -> DedupKey {
        DedupKey::new(item_id.clone(), kind, TimeBucket::of(at, self.dedup_window))
    }

    /// Evaluate one cycle.
    ///
    /// `thresholds` is the snapshot taken when the job started; `observed_at` is
    /// the job's scheduled time so a re-run derives the same dedup keys.
    pub fn evaluate(
        &self,
        thresholds: &ThresholdConfig,
        predictions: &[PredictionRecord],
        stock: &StockLevels,
        cursors: &Cursors,
        partition: Partition,
        observed_at: DateTime<Utc>,
    ) -> Evaluation {
        let mut out = Evaluation::default();

        // Newest record per item/horizon, dropping anything behind the cursor.
        let mut latest: BTreeMap<CursorKey, &PredictionRecord> = BTreeMap::new();
        for record in predictions.iter().filter(|r| partition.contains(&r.item_id)) {
            let key = CursorKey::for_record(record);
            if cursors.get(&key).is_some_and(|seen| record.produced_at < *seen) {
                out.skipped_stale += 1;
                continue;
            }
            match latest.get(&key) {
                Some(prev) if prev.produced_at >= record.produced_at => out.skipped_stale += 1,
                Some(_) => {
                    out.skipped_stale += 1;
                    latest.insert(key, record);
                }
                None => {
                    latest.insert(key, record);
                }
            }
        }

        for (key, record) in &latest {
            let item_stock = stock.get(&record.item_id).copied();

            if record.score >= thresholds.rush_prediction_threshold {
                let severity = if record.score >= RUSH_HIGH_SCORE {
                    Severity::High
                } else {
                    Severity::Medium
                };
                out.candidates.push(AlertCandidate {
                    dedup_key: self.key(&record.item_id, AlertKind::Rush, observed_at),
                    severity,
                    observed_at,
                    message: format!(
                        "rush predicted for item {}: score {:.2}, expected demand {:.1} units",
                        record.item_id, record.score, record.expected_demand
                    ),
                    score: Some(record.score),
                    stock: item_stock,
                });
            }

            let pressure = stock_pressure(item_stock, record.expected_demand);
            let risk = composite_risk(record.score, pressure);
            if risk >= thresholds.alert_threshold {
                let severity = if risk >= (1.0 + thresholds.alert_threshold) / 2.0 {
                    Severity::High
                } else {
                    Severity::Medium
                };
                out.candidates.push(AlertCandidate {
                    dedup_key: self.key(&record.item_id, AlertKind::General, observed_at),
                    severity,
                    observed_at,
                    message: format!(
                        "item {} at risk: composite {:.2} (score {:.2}, stock pressure {:.2})",
                        record.item_id, risk, record.score, pressure
                    ),
                    score: Some(record.score),
                    stock: item_stock,
                });
            }

            out.advanced.insert(key.clone(), record.produced_at);
        }

        for (item_id, qty) in stock.iter().filter(|(i, _)| partition.contains(i)) {
            if *qty > thresholds.low_stock_threshold {
                continue;
            }
            let (severity, message) = if *qty <= 0 {
                (Severity::High, format!("item {item_id} is out of stock"))
            } else {
                (
                    Severity::Medium,
                    format!(
                        "item {item_id} is running low: {qty} on hand, threshold {}",
                        thresholds.low_stock_threshold
                    ),
                )
            };
            out.candidates.push(AlertCandidate {
                dedup_key: self.key(item_id, AlertKind::LowStock, observed_at),
                severity,
                observed_at,
                message,
                score: None,
                stock: Some(*qty),
            });
        }

        debug!(
            candidates = out.candidates.len(),
            skipped_stale = out.skipped_stale,
            "evaluation complete"
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use shoptrack_core::ModelVersion;

    fn t(h: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap() + chrono::Duration::hours(h)
    }

    fn thresholds() -> ThresholdConfig {
        ThresholdConfig {
            alert_threshold: 0.7,
            low_stock_threshold: 10,
            rush_prediction_threshold: 0.8,
        }
    }

    fn pred(item: &str, score: f64, at: DateTime<Utc>) -> PredictionRecord {
        PredictionRecord {
            item_id: ItemId::new(item),
            horizon_start: at,
            horizon_end: at + chrono::Duration::hours(24),
            score,
            expected_demand: 5.0,
            confidence: 0.5,
            produced_by_model_version: ModelVersion(1),
            produced_at: at,
        }
    }

    fn evaluator() -> AlertEvaluator {
        AlertEvaluator::new(Duration::from_secs(24 * 3600))
    }

    #[test]
    fn rush_and_low_stock_triggers() {
        let mut stock = StockLevels::new();
        stock.insert(ItemId::new("y"), 8);
        stock.insert(ItemId::new("z"), 0);
        stock.insert(ItemId::new("w"), 50);

        let eval = evaluator().evaluate(
            &thresholds(),
            &[pred("x", 0.85, t(1)), pred("w", 0.2, t(1))],
            &stock,
            &Cursors::new(),
            Partition::ALL,
            t(1),
        );

        let kinds: Vec<(String, AlertKind, Severity)> = eval
            .candidates
            .iter()
            .map(|c| (c.dedup_key.item_id.to_string(), c.dedup_key.kind, c.severity))
            .collect();
        assert!(kinds.contains(&("x".into(), AlertKind::Rush, Severity::Medium)));
        assert!(kinds.contains(&("y".into(), AlertKind::LowStock, Severity::Medium)));
        assert!(kinds.contains(&("z".into(), AlertKind::LowStock, Severity::High)));
        assert!(!kinds.iter().any(|(i, _, _)| i == "w"));
        assert_eq!(eval.advanced.len(), 2);
    }

    #[test]
    fn stale_records_are_not_evaluated() {
        let mut cursors = Cursors::new();
        let fresh = pred("x", 0.9, t(2));
        cursors.insert(CursorKey::for_record(&fresh), t(2));

        let eval = evaluator().evaluate(
            &thresholds(),
            &[pred("x", 0.99, t(1))],
            &StockLevels::new(),
            &cursors,
            Partition::ALL,
            t(3),
        );
        assert!(eval.candidates.is_empty());
        assert_eq!(eval.skipped_stale, 1);
    }

    #[test]
    fn only_newest_record_per_item_is_evaluated() {
        let eval = evaluator().evaluate(
            &thresholds(),
            &[pred("x", 0.99, t(1)), pred("x", 0.1, t(2))],
            &StockLevels::new(),
            &Cursors::new(),
            Partition::ALL,
            t(2),
        );
        assert!(eval.candidates.is_empty());
        assert_eq!(eval.skipped_stale, 1);
        assert_eq!(eval.advanced.values().next(), Some(&t(2)));
    }

    #[test]
    fn general_alert_combines_score_and_stock_pressure() {
        // score 0.7, demand 5, stock 0 -> pressure 1.0 -> risk 0.82
        let mut stock = StockLevels::new();
        stock.insert(ItemId::new("x"), 0);
        let mut thresholds = thresholds();
        thresholds.low_stock_threshold = -1;

        let eval = evaluator().evaluate(
            &thresholds,
            &[pred("x", 0.7, t(1))],
            &stock,
            &Cursors::new(),
            Partition::ALL,
            t(1),
        );
        assert_eq!(eval.candidates.len(), 1);
        assert_eq!(eval.candidates[0].dedup_key.kind, AlertKind::General);
        assert!((composite_risk(0.7, 1.0) - 0.82).abs() < 1e-9);
    }

    #[test]
    fn pressure_is_bounded() {
        assert_eq!(stock_pressure(None, 10.0), 0.0);
        assert_eq!(stock_pressure(Some(100), 10.0), 0.0);
        assert_eq!(stock_pressure(Some(-3), 10.0), 1.0);
        assert!((stock_pressure(Some(5), 10.0) - 0.5).abs() < 1e-9);
    }
}
