use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::model::{ModelArtifact, TrainedModel};
use crate::result::{ForecastError, ItemScore};
use crate::snapshot::DataSnapshot;

/// Pluggable forecasting capability.
///
/// Implementations must be deterministic: the same artifact, snapshot and
/// horizon always produce the same scores in the same order.
pub trait Forecaster: Send + Sync + 'static {
    /// Stable name recorded in every artifact this forecaster trains.
    fn name(&self) -> &'static str;

    fn train(
        &self,
        snapshot: &DataSnapshot,
        trained_at: DateTime<Utc>,
    ) -> Result<TrainedModel, ForecastError>;

    fn infer(
        &self,
        artifact: &ModelArtifact,
        snapshot: &DataSnapshot,
        horizon: Duration,
    ) -> Result<Vec<ItemScore>, ForecastError>;
}
