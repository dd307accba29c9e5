use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shoptrack_core::ItemId;

use crate::forecaster::Forecaster;
use crate::model::{ModelArtifact, ModelMetrics, TrainedModel};
use crate::result::{ForecastError, ItemScore};
use crate::snapshot::DataSnapshot;

pub const BASELINE_FORECASTER: &str = "rolling-baseline";

/// Floor for the logistic scale, so items with perfectly flat history
/// don't turn every small change into a certain rush.
const MIN_SCALE: f64 = 0.5;

/// Per-item hourly demand statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemBaseline {
    pub mean: f64,
    pub std: f64,
    /// Hours of the training window with at least one sale.
    pub active_hours: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct BaselineParams {
    window_hours: i64,
    recent_hours: i64,
    global: ItemBaseline,
    items: BTreeMap<ItemId, ItemBaseline>,
}

/// Deterministic rolling-baseline forecaster.
///
/// Model:
/// - Train: per-item mean and sample standard deviation of hourly demand over the window.
/// - Infer: take the hourly sales rate over the most recent `recent_hours` of the
///   snapshot and compare it against the item's baseline.
/// - Score is `logistic((rate - mean) / max(std, 0.5))`, so an item selling at its
///   usual pace scores 0.5 and a surge approaches 1.0.
#[derive(Debug, Clone)]
pub struct RollingBaselineForecaster {
    /// Distinct sales hours a training snapshot must contain.
    min_history_hours: usize,
    recent_hours: i64,
}

impl Default for RollingBaselineForecaster {
    fn default() -> Self {
        Self {
            min_history_hours: 24,
            recent_hours: 24,
        }
    }
}

impl RollingBaselineForecaster {
    pub fn new(min_history_hours: usize) -> Self {
        Self {
            min_history_hours,
            ..Self::default()
        }
    }

    pub fn with_recent_hours(mut self, hours: i64) -> Self {
        self.recent_hours = hours.max(1);
        self
    }

    fn params(artifact: &ModelArtifact) -> Result<BaselineParams, ForecastError> {
        if artifact.forecaster != BASELINE_FORECASTER {
            return Err(ForecastError::InvalidArtifact(format!(
                "artifact {} was trained by '{}'",
                artifact.version, artifact.forecaster
            )));
        }
        serde_json::from_value(artifact.params.clone())
            .map_err(|e| ForecastError::InvalidArtifact(format!("artifact {}: {e}", artifact.version)))
    }
}

impl Forecaster for RollingBaselineForecaster {
    fn name(&self) -> &'static str {
        BASELINE_FORECASTER
    }

    fn train(
        &self,
        snapshot: &DataSnapshot,
        trained_at: DateTime<Utc>,
    ) -> Result<TrainedModel, ForecastError> {
        let distinct_hours = snapshot.distinct_hours();
        if distinct_hours < self.min_history_hours {
            return Err(ForecastError::InsufficientHistory(format!(
                "{distinct_hours} distinct sales hour(s) in window, need {}",
                self.min_history_hours
            )));
        }

        let mut items = BTreeMap::new();
        let mut all_hours: Vec<f64> = Vec::new();
        let mut abs_dev_sum = 0.0;
        let mut abs_dev_n = 0usize;

        for item in snapshot.items() {
            let series = snapshot.hourly_demand(&item);
            let m = mean(&series);
            let s = stddev_sample(&series, m);
            abs_dev_sum += series.iter().map(|x| (x - m).abs()).sum::<f64>();
            abs_dev_n += series.len();
            let active_hours = series.iter().filter(|x| **x > 0.0).count();
            all_hours.extend_from_slice(&series);
            items.insert(
                item,
                ItemBaseline {
                    mean: m,
                    std: s,
                    active_hours,
                },
            );
        }

        let gm = mean(&all_hours);
        let params = BaselineParams {
            window_hours: snapshot.window.hours(),
            recent_hours: self.recent_hours,
            global: ItemBaseline {
                mean: gm,
                std: stddev_sample(&all_hours, gm),
                active_hours: 0,
            },
            items,
        };

        let metrics = ModelMetrics {
            training_rows: snapshot.rows.len(),
            items: params.items.len(),
            distinct_hours,
            in_sample_mae: if abs_dev_n == 0 {
                0.0
            } else {
                abs_dev_sum / abs_dev_n as f64
            },
        };

        let params = serde_json::to_value(&params)
            .map_err(|e| ForecastError::InvalidInput(format!("cannot encode params: {e}")))?;

        Ok(TrainedModel {
            forecaster: BASELINE_FORECASTER.to_string(),
            trained_at,
            metrics,
            params,
            source_job: None,
        })
    }

    fn infer(
        &self,
        artifact: &ModelArtifact,
        snapshot: &DataSnapshot,
        horizon: Duration,
    ) -> Result<Vec<ItemScore>, ForecastError> {
        let params = Self::params(artifact)?;
        let recent_hours = params.recent_hours.max(1);
        if snapshot.window.hours() < recent_hours {
            return Err(ForecastError::InsufficientHistory(format!(
                "inference window covers {}h, need {recent_hours}h",
                snapshot.window.hours()
            )));
        }
        let horizon_hours = horizon.as_secs_f64() / 3600.0;
        if !(horizon_hours.is_finite() && horizon_hours > 0.0) {
            return Err(ForecastError::InvalidInput("horizon must be positive".to_string()));
        }

        // Tracked items: everything the model knows plus anything selling now.
        let tracked: BTreeSet<ItemId> = params
            .items
            .keys()
            .cloned()
            .chain(snapshot.items())
            .collect();

        let mut scores = Vec::with_capacity(tracked.len());
        for item_id in tracked {
            let baseline = params.items.get(&item_id).unwrap_or(&params.global);
            let rate = snapshot.recent_units(&item_id, recent_hours) / recent_hours as f64;
            let z = (rate - baseline.mean) / baseline.std.max(MIN_SCALE);
            let n = baseline.active_hours as f64;
            scores.push(ItemScore {
                item_id,
                score: logistic(z),
                expected_demand: rate * horizon_hours,
                confidence: n / (n + recent_hours as f64),
            });
        }
        Ok(scores)
    }
}

pub fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / (xs.len() as f64)
}

/// Sample standard deviation (n-1), deterministic.
fn stddev_sample(xs: &[f64], mean: f64) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let var = xs
        .iter()
        .map(|x| {
            let d = x - mean;
            d * d
        })
        .sum::<f64>()
        / ((xs.len() - 1) as f64);
    var.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{SalesRecord, SnapshotWindow};
    use chrono::TimeZone;
    use shoptrack_core::ModelVersion;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    /// 48h of steady sales for "steady" (2/h) and "hot" (1/h, then 10/h in the last 24h).
    fn history() -> DataSnapshot {
        let window = SnapshotWindow {
            start: t0(),
            end: t0() + chrono::Duration::hours(48),
        };
        let mut rows = Vec::new();
        for h in 0..48 {
            let at = t0() + chrono::Duration::hours(h) + chrono::Duration::minutes(5);
            rows.push(SalesRecord {
                item_id: ItemId::new("steady"),
                sold_at: at,
                quantity: 2,
            });
            rows.push(SalesRecord {
                item_id: ItemId::new("hot"),
                sold_at: at,
                quantity: if h < 24 { 1 } else { 10 },
            });
        }
        DataSnapshot::new(window, rows)
    }

    fn publish(model: TrainedModel) -> ModelArtifact {
        ModelArtifact::from_trained(ModelVersion(1), "memory://1", model)
    }

    #[test]
    fn train_rejects_short_history() {
        let f = RollingBaselineForecaster::new(100);
        let err = f.train(&history(), t0()).unwrap_err();
        assert!(matches!(err, ForecastError::InsufficientHistory(_)));
    }

    #[test]
    fn surging_item_scores_above_steady_item() {
        let f = RollingBaselineForecaster::default();
        let train_window = SnapshotWindow {
            start: t0(),
            end: t0() + chrono::Duration::hours(24),
        };
        let base = history();
        let train_rows = base
            .rows
            .iter()
            .filter(|r| train_window.contains(r.sold_at))
            .cloned()
            .collect();
        let model = f.train(&DataSnapshot::new(train_window, train_rows), t0()).unwrap();
        assert_eq!(model.metrics.items, 2);

        let artifact = publish(model);
        let scores = f
            .infer(&artifact, &history(), Duration::from_secs(24 * 3600))
            .unwrap();

        let hot = scores.iter().find(|s| s.item_id.as_str() == "hot").unwrap();
        let steady = scores.iter().find(|s| s.item_id.as_str() == "steady").unwrap();
        assert!(hot.score > 0.99, "hot score {}", hot.score);
        assert!((steady.score - 0.5).abs() < 1e-9);
        assert!((hot.expected_demand - 240.0).abs() < 1e-9);
    }

    #[test]
    fn inference_is_deterministic() {
        let f = RollingBaselineForecaster::default();
        let artifact = publish(f.train(&history(), t0()).unwrap());
        let a = f.infer(&artifact, &history(), Duration::from_secs(3600)).unwrap();
        let b = f.infer(&artifact, &history(), Duration::from_secs(3600)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn foreign_artifact_is_rejected() {
        let f = RollingBaselineForecaster::default();
        let mut artifact = publish(f.train(&history(), t0()).unwrap());
        artifact.forecaster = "other".to_string();
        let err = f
            .infer(&artifact, &history(), Duration::from_secs(3600))
            .unwrap_err();
        assert!(matches!(err, ForecastError::InvalidArtifact(_)));
    }
}
