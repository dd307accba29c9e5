//! `shoptrack-core`: shared building blocks for the prediction-and-alerting pipeline.
//!
//! This crate has no infrastructure concerns: identifiers, the error taxonomy,
//! the clock abstraction and process settings.

pub mod clock;
pub mod config;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, LogFormat, Settings, SharedThresholds, ThresholdConfig};
pub use error::{ErrorClass, PipelineError, PipelineResult};
pub use id::{AlertId, ItemId, JobId, ModelVersion};
