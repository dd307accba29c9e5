use serde::{Deserialize, Serialize};
use thiserror::Error;

use shoptrack_core::{ItemId, PipelineError};

/// Raw per-item output of a forecaster, before it becomes a `PredictionRecord`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemScore {
    pub item_id: ItemId,

    /// Rush score in [0, 1]; higher means a stronger predicted surge.
    pub score: f64,

    /// Expected units sold over the horizon.
    pub expected_demand: f64,

    /// Confidence in [0, 1] (recommended convention; not enforced).
    pub confidence: f64,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ForecastError {
    #[error("insufficient history: {0}")]
    InsufficientHistory(String),

    #[error("artifact cannot be used by this forecaster: {0}")]
    InvalidArtifact(String),

    #[error("invalid forecaster input: {0}")]
    InvalidInput(String),
}

impl From<ForecastError> for PipelineError {
    fn from(err: ForecastError) -> Self {
        match err {
            ForecastError::InsufficientHistory(msg) => PipelineError::DataInsufficient(msg),
            ForecastError::InvalidArtifact(msg) => PipelineError::InvariantViolation(msg),
            ForecastError::InvalidInput(msg) => PipelineError::InvalidInput(msg),
        }
    }
}
