//! Pipeline error model.

use thiserror::Error;

/// Result type used across the pipeline.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// How a failure should be treated by the worker pool.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Store/queue momentarily unreachable: retry with backoff.
    TransientInfra,
    /// Insufficient or corrupt snapshot: succeed with a warning, never retry.
    DataQuality,
    /// No model published yet: retry on a longer backoff.
    ModelUnavailable,
    /// Broken internal invariant: fatal, surfaced as an operational alert.
    LogicInvariantViolation,
}

/// Pipeline-level error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Backing persistence (queue, sink, model store, data source) unreachable.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A job exceeded its execution timeout.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The snapshot does not carry enough history to train or infer.
    #[error("insufficient data: {0}")]
    DataInsufficient(String),

    /// The snapshot is malformed (negative quantities, out-of-window rows, ...).
    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    /// No current model artifact exists yet (cold start).
    #[error("no model artifact is available")]
    ModelUnavailable,

    /// An internal invariant was observed broken.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// Caller supplied an invalid value (ids, filters, admin requests).
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl PipelineError {
    pub fn store(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    pub fn insufficient(msg: impl Into<String>) -> Self {
        Self::DataInsufficient(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptSnapshot(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Classify the error for retry/abandon decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::StoreUnavailable(_) | Self::Timeout(_) => ErrorClass::TransientInfra,
            Self::DataInsufficient(_) | Self::CorruptSnapshot(_) => ErrorClass::DataQuality,
            Self::ModelUnavailable => ErrorClass::ModelUnavailable,
            // A handler receiving invalid input is a wiring bug, never fixed by retrying.
            Self::InvariantViolation(_) | Self::InvalidInput(_) => ErrorClass::LogicInvariantViolation,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::TransientInfra | ErrorClass::ModelUnavailable
        )
    }
}

/// Map a poisoned lock into a transient store failure.
pub fn poisoned<T>(_: std::sync::PoisonError<T>) -> PipelineError {
    PipelineError::store("lock poisoned")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_classes() {
        assert_eq!(PipelineError::store("x").class(), ErrorClass::TransientInfra);
        assert_eq!(
            PipelineError::Timeout(std::time::Duration::from_secs(1)).class(),
            ErrorClass::TransientInfra
        );
        assert_eq!(PipelineError::insufficient("x").class(), ErrorClass::DataQuality);
        assert_eq!(PipelineError::corrupt("x").class(), ErrorClass::DataQuality);
        assert_eq!(PipelineError::ModelUnavailable.class(), ErrorClass::ModelUnavailable);
        assert_eq!(
            PipelineError::invariant("two current pointers").class(),
            ErrorClass::LogicInvariantViolation
        );
    }

    #[test]
    fn only_infra_and_cold_start_are_retryable() {
        assert!(PipelineError::store("x").is_retryable());
        assert!(PipelineError::ModelUnavailable.is_retryable());
        assert!(!PipelineError::insufficient("x").is_retryable());
        assert!(!PipelineError::invariant("x").is_retryable());
    }
}
