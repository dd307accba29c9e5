//! Reads the retail schema: `sales`, `sale_items`, `inventory_levels`.

use sqlx::Row;

use shoptrack_ai::{DataSnapshot, DataSource, SalesRecord, SnapshotWindow, StockLevels};
use shoptrack_core::{ItemId, PipelineResult};

use crate::pg::{map_sqlx_error, PgContext};

#[derive(Debug, Clone)]
pub struct PostgresDataSource {
    pg: PgContext,
}

impl PostgresDataSource {
    pub fn new(pg: PgContext) -> Self {
        Self { pg }
    }
}

impl DataSource for PostgresDataSource {
    fn read_snapshot(&self, window: SnapshotWindow) -> PipelineResult<DataSnapshot> {
        self.pg.block_on(async {
            // REPEATABLE READ so the whole window comes from one consistent view.
            let mut tx = self
                .pg
                .pool()
                .begin()
                .await
                .map_err(|e| map_sqlx_error("read_snapshot", e))?;
            sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("read_snapshot", e))?;

            let rows = sqlx::query(
                r#"
                SELECT
                    si.product_id::TEXT AS item_id,
                    s.created_at        AS sold_at,
                    si.quantity::BIGINT AS quantity
                FROM sales s
                JOIN sale_items si ON si.sale_id = s.id
                WHERE s.status = 'completed'
                  AND s.created_at >= $1
                  AND s.created_at < $2
                ORDER BY s.created_at ASC, si.product_id ASC
                "#,
            )
            .bind(window.start)
            .bind(window.end)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("read_snapshot", e))?;
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("read_snapshot", e))?;

            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                out.push(SalesRecord {
                    item_id: ItemId::new(
                        row.try_get::<String, _>("item_id")
                            .map_err(|e| map_sqlx_error("read_snapshot", e))?,
                    ),
                    sold_at: row
                        .try_get("sold_at")
                        .map_err(|e| map_sqlx_error("read_snapshot", e))?,
                    quantity: row
                        .try_get("quantity")
                        .map_err(|e| map_sqlx_error("read_snapshot", e))?,
                });
            }
            Ok(DataSnapshot::new(window, out))
        })
    }

    fn read_stock_levels(&self) -> PipelineResult<StockLevels> {
        self.pg.block_on(async {
            let rows = sqlx::query(
                r#"
                SELECT product_id::TEXT AS item_id, available_quantity::BIGINT AS quantity
                FROM inventory_levels
                "#,
            )
            .fetch_all(self.pg.pool())
            .await
            .map_err(|e| map_sqlx_error("read_stock_levels", e))?;

            let mut levels = StockLevels::new();
            for row in rows {
                let item: String = row
                    .try_get("item_id")
                    .map_err(|e| map_sqlx_error("read_stock_levels", e))?;
                let qty: i64 = row
                    .try_get("quantity")
                    .map_err(|e| map_sqlx_error("read_stock_levels", e))?;
                // Several locations per product sum up to one level.
                *levels.entry(ItemId::new(item)).or_insert(0) += qty;
            }
            Ok(levels)
        })
    }
}
