use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use shoptrack_core::{JobId, ModelVersion};

/// Metrics captured when a model is trained.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub training_rows: usize,
    pub items: usize,
    pub distinct_hours: usize,
    /// Mean absolute deviation of hourly demand from the fitted baseline.
    pub in_sample_mae: f64,
}

/// Output of `Forecaster::train`, not yet versioned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedModel {
    pub forecaster: String,
    pub trained_at: DateTime<Utc>,
    pub metrics: ModelMetrics,
    /// Forecaster-specific parameters; opaque to the pipeline.
    pub params: JsonValue,
    /// RETRAIN job that produced this model (publish is idempotent per job).
    pub source_job: Option<JobId>,
}

/// A published, immutable model artifact.
///
/// Only the model store creates these; the content never changes after publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub version: ModelVersion,
    pub forecaster: String,
    pub trained_at: DateTime<Utc>,
    /// Where the artifact blob lives (file path or `memory://` reference).
    pub location: String,
    pub metrics: ModelMetrics,
    pub params: JsonValue,
    pub source_job: Option<JobId>,
}

impl ModelArtifact {
    pub fn from_trained(version: ModelVersion, location: impl Into<String>, trained: TrainedModel) -> Self {
        Self {
            version,
            forecaster: trained.forecaster,
            trained_at: trained.trained_at,
            location: location.into(),
            metrics: trained.metrics,
            params: trained.params,
            source_job: trained.source_job,
        }
    }
}
