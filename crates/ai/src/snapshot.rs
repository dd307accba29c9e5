use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};

use shoptrack_core::{ItemId, PipelineError, PipelineResult};

/// One sold line: `quantity` units of `item_id` at `sold_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalesRecord {
    pub item_id: ItemId,
    pub sold_at: DateTime<Utc>,
    pub quantity: i64,
}

/// Half-open time window `[start, end)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SnapshotWindow {
    /// Window of length `len` ending (exclusive) at `end`.
    pub fn ending_at(end: DateTime<Utc>, len: std::time::Duration) -> Self {
        let len = Duration::from_std(len).unwrap_or(Duration::zero());
        Self {
            start: end - len,
            end,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }

    /// Whole hours covered by the window (at least one).
    pub fn hours(&self) -> i64 {
        (self.end - self.start).num_hours().max(1)
    }
}

/// Current on-hand quantity per item.
pub type StockLevels = BTreeMap<ItemId, i64>;

/// A consistent window of sales records used for training or inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSnapshot {
    pub window: SnapshotWindow,
    pub rows: Vec<SalesRecord>,
}

impl DataSnapshot {
    pub fn new(window: SnapshotWindow, rows: Vec<SalesRecord>) -> Self {
        Self { window, rows }
    }

    /// Reject rows outside the window and negative quantities.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.window.end <= self.window.start {
            return Err(PipelineError::corrupt("snapshot window is empty"));
        }
        for row in &self.rows {
            if row.quantity < 0 {
                return Err(PipelineError::corrupt(format!(
                    "negative quantity {} for item {}",
                    row.quantity, row.item_id
                )));
            }
            if !self.window.contains(row.sold_at) {
                return Err(PipelineError::corrupt(format!(
                    "row for item {} at {} lies outside the snapshot window",
                    row.item_id, row.sold_at
                )));
            }
        }
        Ok(())
    }

    pub fn items(&self) -> BTreeSet<ItemId> {
        self.rows.iter().map(|r| r.item_id.clone()).collect()
    }

    /// Number of distinct clock hours that saw at least one sale.
    pub fn distinct_hours(&self) -> usize {
        self.rows
            .iter()
            .filter_map(|r| r.sold_at.duration_trunc(Duration::hours(1)).ok())
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Units sold per hour slot of the window for one item, zero-filled.
    ///
    /// Index 0 is the first hour of the window.
    pub fn hourly_demand(&self, item_id: &ItemId) -> Vec<f64> {
        let hours = self.window.hours() as usize;
        let mut buckets = vec![0.0; hours];
        for row in self.rows.iter().filter(|r| &r.item_id == item_id) {
            let idx = (row.sold_at - self.window.start).num_hours();
            if idx >= 0 && (idx as usize) < hours {
                buckets[idx as usize] += row.quantity as f64;
            }
        }
        buckets
    }

    /// Units sold for one item within the trailing `hours` of the window.
    pub fn recent_units(&self, item_id: &ItemId, hours: i64) -> f64 {
        let from = self.window.end - Duration::hours(hours);
        self.rows
            .iter()
            .filter(|r| &r.item_id == item_id && r.sold_at >= from)
            .map(|r| r.quantity as f64)
            .sum()
    }
}

/// Read boundary to the sales/inventory storage engine.
///
/// This crate stays storage-agnostic: implementations live in infra.
pub trait DataSource: Send + Sync + 'static {
    fn read_snapshot(&self, window: SnapshotWindow) -> PipelineResult<DataSnapshot>;

    fn read_stock_levels(&self) -> PipelineResult<StockLevels>;
}
