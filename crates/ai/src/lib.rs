//! `shoptrack-ai`
//!
//! **Responsibility:** forecasting boundary of the pipeline.
//!
//! This crate is storage-agnostic:
//! - Snapshots are read through the `DataSource` trait; implementations live in infra.
//! - Forecasters are pluggable behind `Forecaster`; the rolling baseline is the default.
//! - The `PredictionEngine` turns a pinned artifact and a snapshot into `PredictionRecord`s.

pub mod baseline;
pub mod engine;
pub mod forecaster;
pub mod model;
pub mod result;
pub mod snapshot;

pub use baseline::{RollingBaselineForecaster, BASELINE_FORECASTER};
pub use engine::{Partition, PredictionEngine, PredictionRecord};
pub use forecaster::Forecaster;
pub use model::{ModelArtifact, ModelMetrics, TrainedModel};
pub use result::{ForecastError, ItemScore};
pub use snapshot::{DataSnapshot, DataSource, SalesRecord, SnapshotWindow, StockLevels};
