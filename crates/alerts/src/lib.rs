//! `shoptrack-alerts`
//!
//! Alert model, deduplication and routing.
//!
//! - `AlertEvaluator` decides which conditions fire this cycle.
//! - `AlertLedger` reconciles candidates with stored alerts (one open record per dedup key).
//! - `channels_for` maps severity to delivery channels.

pub mod evaluator;
pub mod ledger;
pub mod record;
pub mod routing;

pub use evaluator::{composite_risk, stock_pressure, AlertEvaluator, CursorKey, Cursors, Evaluation};
pub use ledger::{AlertFilter, AlertLedger, AlertStats};
pub use record::{
    AlertCandidate, AlertKind, AlertRecord, AlertStatus, DedupKey, OperationalAlert, Resolution, Severity,
    TimeBucket, UpsertOutcome,
};
pub use routing::{channels_for, NotificationChannel};
