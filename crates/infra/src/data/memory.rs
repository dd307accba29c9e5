use std::sync::RwLock;

use shoptrack_ai::{DataSnapshot, DataSource, SalesRecord, SnapshotWindow, StockLevels};
use shoptrack_core::error::poisoned;
use shoptrack_core::{ItemId, PipelineError, PipelineResult};

/// In-memory sales log and stock table, fed through the ingest endpoints.
#[derive(Debug, Default)]
pub struct InMemoryDataSource {
    sales: RwLock<Vec<SalesRecord>>,
    stock: RwLock<StockLevels>,
}

impl InMemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sale(&self, sale: SalesRecord) -> PipelineResult<()> {
        if sale.quantity <= 0 {
            return Err(PipelineError::invalid_input(format!(
                "sale quantity must be positive, got {}",
                sale.quantity
            )));
        }
        self.sales.write().map_err(poisoned)?.push(sale);
        Ok(())
    }

    pub fn record_sales(&self, sales: impl IntoIterator<Item = SalesRecord>) -> PipelineResult<usize> {
        let mut n = 0;
        for sale in sales {
            self.record_sale(sale)?;
            n += 1;
        }
        Ok(n)
    }

    pub fn set_stock(&self, item_id: ItemId, quantity: i64) -> PipelineResult<()> {
        self.stock.write().map_err(poisoned)?.insert(item_id, quantity);
        Ok(())
    }
}

impl DataSource for InMemoryDataSource {
    fn read_snapshot(&self, window: SnapshotWindow) -> PipelineResult<DataSnapshot> {
        let sales = self.sales.read().map_err(poisoned)?;
        let mut rows: Vec<SalesRecord> = sales
            .iter()
            .filter(|s| window.contains(s.sold_at))
            .cloned()
            .collect();
        // Stable order so snapshots of the same window are identical.
        rows.sort_by(|a, b| a.sold_at.cmp(&b.sold_at).then_with(|| a.item_id.cmp(&b.item_id)));
        Ok(DataSnapshot::new(window, rows))
    }

    fn read_stock_levels(&self) -> PipelineResult<StockLevels> {
        Ok(self.stock.read().map_err(poisoned)?.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn snapshot_keeps_only_window_rows() {
        let src = InMemoryDataSource::new();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for h in 0..5 {
            src.record_sale(SalesRecord {
                item_id: ItemId::new("a"),
                sold_at: t0 + chrono::Duration::hours(h),
                quantity: 1,
            })
            .unwrap();
        }
        let window = SnapshotWindow {
            start: t0 + chrono::Duration::hours(1),
            end: t0 + chrono::Duration::hours(3),
        };
        let snap = src.read_snapshot(window).unwrap();
        assert_eq!(snap.rows.len(), 2);
        snap.validate().unwrap();
    }

    #[test]
    fn rejects_non_positive_sales() {
        let src = InMemoryDataSource::new();
        let err = src
            .record_sale(SalesRecord {
                item_id: ItemId::new("a"),
                sold_at: Utc::now(),
                quantity: 0,
            })
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }
}
