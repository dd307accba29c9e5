use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use shoptrack_core::{ItemId, ModelVersion, PipelineError, PipelineResult};

use crate::forecaster::Forecaster;
use crate::model::ModelArtifact;
use crate::snapshot::DataSnapshot;

/// A slice of the item space: items whose stable hash modulo `count` equals `index`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    pub index: u32,
    pub count: u32,
}

impl Partition {
    pub const ALL: Partition = Partition { index: 0, count: 1 };

    pub fn new(index: u32, count: u32) -> PipelineResult<Self> {
        if count == 0 || index >= count {
            return Err(PipelineError::invalid_input(format!(
                "partition {index}/{count} is out of range"
            )));
        }
        Ok(Self { index, count })
    }

    pub fn contains(&self, item_id: &ItemId) -> bool {
        self.count <= 1 || item_id.stable_hash() % u64::from(self.count) == u64::from(self.index)
    }
}

impl Default for Partition {
    fn default() -> Self {
        Self::ALL
    }
}

impl core::fmt::Display for Partition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.index, self.count)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub item_id: ItemId,
    pub horizon_start: DateTime<Utc>,
    pub horizon_end: DateTime<Utc>,
    pub score: f64,
    pub expected_demand: f64,
    pub confidence: f64,
    pub produced_by_model_version: ModelVersion,
    pub produced_at: DateTime<Utc>,
}

impl PredictionRecord {
    /// Horizon length in whole seconds; part of the evaluation cursor key.
    pub fn horizon_secs(&self) -> i64 {
        (self.horizon_end - self.horizon_start).num_seconds()
    }
}

/// Runs a pinned artifact over a snapshot and shapes the output into records.
#[derive(Clone)]
pub struct PredictionEngine {
    forecaster: Arc<dyn Forecaster>,
    horizon: Duration,
}

impl PredictionEngine {
    pub fn new(forecaster: Arc<dyn Forecaster>, horizon: Duration) -> Self {
        Self { forecaster, horizon }
    }

    pub fn forecaster(&self) -> &Arc<dyn Forecaster> {
        &self.forecaster
    }

    pub fn horizon(&self) -> Duration {
        self.horizon
    }

    /// Produce one record per tracked item in `partition`, sorted by item id.
    ///
    /// `produced_at` is supplied by the caller (the job's scheduled time) so a
    /// re-run of the same job yields identical records.
    pub fn run(
        &self,
        artifact: &ModelArtifact,
        snapshot: &DataSnapshot,
        produced_at: DateTime<Utc>,
        partition: Partition,
    ) -> PipelineResult<Vec<PredictionRecord>> {
        snapshot.validate()?;

        let horizon = chrono::Duration::from_std(self.horizon)
            .map_err(|e| PipelineError::invalid_input(format!("horizon: {e}")))?;

        let scores = self.forecaster.infer(artifact, snapshot, self.horizon)?;

        let mut records: Vec<PredictionRecord> = scores
            .into_iter()
            .filter(|s| partition.contains(&s.item_id))
            .map(|s| PredictionRecord {
                item_id: s.item_id,
                horizon_start: produced_at,
                horizon_end: produced_at + horizon,
                score: s.score.clamp(0.0, 1.0),
                expected_demand: s.expected_demand,
                confidence: s.confidence,
                produced_by_model_version: artifact.version,
                produced_at,
            })
            .collect();
        records.sort_by(|a, b| a.item_id.cmp(&b.item_id));

        debug!(
            version = %artifact.version,
            partition = %partition,
            records = records.len(),
            "prediction run complete"
        );
        Ok(records)
    }
}
