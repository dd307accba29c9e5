//! Postgres-backed result & alert sink.
//!
//! The "one open alert per dedup key" rule is enforced twice: `upsert_alert`
//! locks the open row (`FOR UPDATE`) inside a transaction, and a partial unique
//! index rejects a second open row if two writers race past the lock.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::instrument;

use shoptrack_ai::PredictionRecord;
use shoptrack_alerts::{
    AlertCandidate, AlertFilter, AlertKind, AlertRecord, AlertStats, CursorKey, Cursors,
    DedupKey, OperationalAlert, Resolution, Severity, TimeBucket, UpsertOutcome,
};
use shoptrack_core::{AlertId, ItemId, JobId, ModelVersion, PipelineResult};

use super::{PredictionQuery, ResultSink};
use crate::pg::{map_sqlx_error, PgContext};

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS pipeline_predictions (
        item_id          TEXT             NOT NULL,
        horizon_start    TIMESTAMPTZ      NOT NULL,
        horizon_end      TIMESTAMPTZ      NOT NULL,
        produced_at      TIMESTAMPTZ      NOT NULL,
        score            DOUBLE PRECISION NOT NULL,
        expected_demand  DOUBLE PRECISION NOT NULL,
        confidence       DOUBLE PRECISION NOT NULL,
        model_version    BIGINT           NOT NULL,
        PRIMARY KEY (item_id, horizon_start, horizon_end, produced_at)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pipeline_alerts (
        id                  UUID PRIMARY KEY,
        item_id             TEXT        NOT NULL,
        kind                TEXT        NOT NULL,
        bucket              BIGINT      NOT NULL,
        dedup_key           TEXT        NOT NULL,
        severity            TEXT        NOT NULL,
        message             TEXT        NOT NULL,
        score               DOUBLE PRECISION,
        stock               BIGINT,
        first_triggered_at  TIMESTAMPTZ NOT NULL,
        triggered_at        TIMESTAMPTZ NOT NULL,
        expires_at          TIMESTAMPTZ NOT NULL,
        acknowledged        BOOLEAN     NOT NULL DEFAULT FALSE,
        acknowledged_at     TIMESTAMPTZ,
        acknowledged_by     TEXT,
        expired             BOOLEAN     NOT NULL DEFAULT FALSE
    )
    "#,
    "ALTER TABLE pipeline_alerts ADD COLUMN IF NOT EXISTS resolution TEXT",
    "ALTER TABLE pipeline_alerts ADD COLUMN IF NOT EXISTS resolved_at TIMESTAMPTZ",
    "ALTER TABLE pipeline_alerts ADD COLUMN IF NOT EXISTS resolved_by TEXT",
    "DROP INDEX IF EXISTS pipeline_alerts_one_open_per_key",
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS pipeline_alerts_open_key
        ON pipeline_alerts (dedup_key)
        WHERE NOT acknowledged AND NOT expired AND resolution IS NULL
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pipeline_operational_alerts (
        id         UUID PRIMARY KEY,
        severity   TEXT        NOT NULL,
        source     TEXT        NOT NULL,
        job_id     UUID,
        message    TEXT        NOT NULL,
        raised_at  TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pipeline_evaluation_cursors (
        item_id       TEXT        NOT NULL,
        horizon_secs  BIGINT      NOT NULL,
        produced_at   TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (item_id, horizon_secs)
    )
    "#,
];

const ALERT_COLUMNS: &str = "id, item_id, kind, bucket, severity, message, score, stock, \
     first_triggered_at, triggered_at, expires_at, acknowledged, acknowledged_at, \
     acknowledged_by, expired, resolution, resolved_at, resolved_by";

#[derive(Debug, Clone)]
pub struct PostgresResultSink {
    pg: PgContext,
    alert_ttl: chrono::Duration,
}

impl PostgresResultSink {
    pub fn new(pg: PgContext, alert_ttl: std::time::Duration) -> Self {
        Self {
            pg,
            alert_ttl: chrono::Duration::from_std(alert_ttl).unwrap_or(chrono::Duration::hours(24)),
        }
    }

    /// Create the sink tables if missing.
    pub async fn migrate(&self) -> PipelineResult<()> {
        for stmt in MIGRATIONS {
            sqlx::query(stmt)
                .execute(self.pg.pool())
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }

    async fn put_predictions_async(&self, records: &[PredictionRecord]) -> PipelineResult<usize> {
        let mut tx = self
            .pg
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("put_predictions", e))?;
        for r in records {
            sqlx::query(
                r#"
                INSERT INTO pipeline_predictions (
                    item_id, horizon_start, horizon_end, produced_at,
                    score, expected_demand, confidence, model_version
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (item_id, horizon_start, horizon_end, produced_at)
                DO UPDATE SET
                    score = EXCLUDED.score,
                    expected_demand = EXCLUDED.expected_demand,
                    confidence = EXCLUDED.confidence,
                    model_version = EXCLUDED.model_version
                "#,
            )
            .bind(r.item_id.as_str())
            .bind(r.horizon_start)
            .bind(r.horizon_end)
            .bind(r.produced_at)
            .bind(r.score)
            .bind(r.expected_demand)
            .bind(r.confidence)
            .bind(r.produced_by_model_version.0 as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("put_predictions", e))?;
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("put_predictions", e))?;
        Ok(records.len())
    }

    async fn upsert_alert_async(&self, candidate: AlertCandidate, ttl: chrono::Duration) -> PipelineResult<UpsertOutcome> {
        let key = candidate.dedup_key.to_string();
        let mut tx = self
            .pg
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("upsert_alert", e))?;

        let existing = sqlx::query(&format!(
            "SELECT {ALERT_COLUMNS} FROM pipeline_alerts \
             WHERE dedup_key = $1 AND NOT acknowledged AND NOT expired AND resolution IS NULL \
             FOR UPDATE"
        ))
        .bind(&key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("upsert_alert", e))?
        .map(|row| alert_from_row(&row))
        .transpose()?;

        if let Some(mut record) = existing {
            if record.expires_at > candidate.observed_at {
                let from = record.absorb(candidate, ttl);
                sqlx::query(
                    r#"
                    UPDATE pipeline_alerts SET
                        severity = $2, message = $3, score = $4, stock = $5,
                        triggered_at = $6, expires_at = $7
                    WHERE id = $1
                    "#,
                )
                .bind(*record.id.as_uuid())
                .bind(record.severity.as_str())
                .bind(&record.message)
                .bind(record.score)
                .bind(record.stock)
                .bind(record.triggered_at)
                .bind(record.expires_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("upsert_alert", e))?;
                tx.commit().await.map_err(|e| map_sqlx_error("upsert_alert", e))?;
                return Ok(match from {
                    Some(from) => UpsertOutcome::Escalated { record, from },
                    None => UpsertOutcome::Updated(record),
                });
            }
            sqlx::query("UPDATE pipeline_alerts SET expired = TRUE WHERE id = $1")
                .bind(*record.id.as_uuid())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("upsert_alert", e))?;
        }

        let record = AlertRecord::open(candidate, ttl);
        sqlx::query(
            r#"
            INSERT INTO pipeline_alerts (
                id, item_id, kind, bucket, dedup_key, severity, message, score, stock,
                first_triggered_at, triggered_at, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(*record.id.as_uuid())
        .bind(record.item_id.as_str())
        .bind(record.kind.as_str())
        .bind(record.dedup_key.bucket.0)
        .bind(&key)
        .bind(record.severity.as_str())
        .bind(&record.message)
        .bind(record.score)
        .bind(record.stock)
        .bind(record.first_triggered_at)
        .bind(record.triggered_at)
        .bind(record.expires_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("upsert_alert", e))?;
        tx.commit().await.map_err(|e| map_sqlx_error("upsert_alert", e))?;
        Ok(UpsertOutcome::Created(record))
    }

    async fn list_alerts_async(&self, filter: &AlertFilter) -> PipelineResult<Vec<AlertRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {ALERT_COLUMNS} FROM pipeline_alerts \
             WHERE ($1::TEXT IS NULL OR kind = $1) AND ($2::TEXT IS NULL OR item_id = $2) \
             ORDER BY triggered_at DESC, id ASC"
        ))
        .bind(filter.kind.map(|k| k.as_str()))
        .bind(filter.item_id.as_ref().map(|i| i.as_str()))
        .fetch_all(self.pg.pool())
        .await
        .map_err(|e| map_sqlx_error("list_alerts", e))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let record = alert_from_row(&row)?;
            // Status is derived from several columns; filter it here so the rule lives in one place.
            if filter.matches(&record) {
                out.push(record);
            }
        }
        Ok(out)
    }
}

fn decode<T>(operation: &str, res: Result<T, sqlx::Error>) -> PipelineResult<T> {
    res.map_err(|e| map_sqlx_error(operation, e))
}

fn alert_from_row(row: &PgRow) -> PipelineResult<AlertRecord> {
    let op = "decode_alert";
    let item_id = ItemId::new(decode::<String>(op, row.try_get("item_id"))?);
    let kind: AlertKind = decode::<String>(op, row.try_get("kind"))?.parse()?;
    let severity: Severity = decode::<String>(op, row.try_get("severity"))?.parse()?;
    let bucket = TimeBucket(decode(op, row.try_get::<i64, _>("bucket"))?);
    Ok(AlertRecord {
        id: AlertId::from_uuid(decode(op, row.try_get::<uuid::Uuid, _>("id"))?),
        dedup_key: DedupKey::new(item_id.clone(), kind, bucket),
        item_id,
        kind,
        severity,
        message: decode(op, row.try_get("message"))?,
        score: decode(op, row.try_get("score"))?,
        stock: decode(op, row.try_get("stock"))?,
        first_triggered_at: decode(op, row.try_get("first_triggered_at"))?,
        triggered_at: decode(op, row.try_get("triggered_at"))?,
        expires_at: decode(op, row.try_get("expires_at"))?,
        acknowledged: decode(op, row.try_get("acknowledged"))?,
        acknowledged_at: decode(op, row.try_get("acknowledged_at"))?,
        acknowledged_by: decode(op, row.try_get("acknowledged_by"))?,
        expired: decode(op, row.try_get("expired"))?,
        resolution: decode::<Option<String>>(op, row.try_get("resolution"))?
            .map(|r| r.parse::<Resolution>())
            .transpose()?,
        resolved_at: decode(op, row.try_get("resolved_at"))?,
        resolved_by: decode(op, row.try_get("resolved_by"))?,
    })
}

fn prediction_from_row(row: &PgRow) -> PipelineResult<PredictionRecord> {
    let op = "decode_prediction";
    Ok(PredictionRecord {
        item_id: ItemId::new(decode::<String>(op, row.try_get("item_id"))?),
        horizon_start: decode(op, row.try_get("horizon_start"))?,
        horizon_end: decode(op, row.try_get("horizon_end"))?,
        score: decode(op, row.try_get("score"))?,
        expected_demand: decode(op, row.try_get("expected_demand"))?,
        confidence: decode(op, row.try_get("confidence"))?,
        produced_by_model_version: ModelVersion(decode::<i64>(op, row.try_get("model_version"))?.max(0) as u64),
        produced_at: decode(op, row.try_get("produced_at"))?,
    })
}

fn operational_from_row(row: &PgRow) -> PipelineResult<OperationalAlert> {
    let op = "decode_operational_alert";
    Ok(OperationalAlert {
        id: AlertId::from_uuid(decode(op, row.try_get::<uuid::Uuid, _>("id"))?),
        severity: decode::<String>(op, row.try_get("severity"))?.parse()?,
        source: decode(op, row.try_get("source"))?,
        job_id: decode(op, row.try_get::<Option<uuid::Uuid>, _>("job_id"))?.map(JobId::from_uuid),
        message: decode(op, row.try_get("message"))?,
        raised_at: decode(op, row.try_get("raised_at"))?,
    })
}

impl ResultSink for PostgresResultSink {
    #[instrument(skip(self, records), fields(records = records.len()), err)]
    fn put_predictions(&self, records: &[PredictionRecord]) -> PipelineResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        self.pg.block_on(self.put_predictions_async(records))
    }

    fn latest_predictions(&self, query: &PredictionQuery) -> PipelineResult<Vec<PredictionRecord>> {
        self.pg.block_on(async {
            let rows = sqlx::query(
                r#"
                SELECT DISTINCT ON (item_id, horizon_end - horizon_start) *
                FROM pipeline_predictions
                WHERE ($1::TEXT IS NULL OR item_id = $1)
                  AND ($2::BIGINT IS NULL OR EXTRACT(EPOCH FROM horizon_end - horizon_start)::BIGINT = $2)
                ORDER BY item_id, horizon_end - horizon_start, produced_at DESC
                "#,
            )
            .bind(query.item_id.as_ref().map(|i| i.as_str()))
            .bind(query.horizon_secs)
            .fetch_all(self.pg.pool())
            .await
            .map_err(|e| map_sqlx_error("latest_predictions", e))?;
            rows.iter().map(prediction_from_row).collect()
        })
    }

    fn prediction_history(
        &self,
        query: &PredictionQuery,
        limit: usize,
    ) -> PipelineResult<Vec<PredictionRecord>> {
        self.pg.block_on(async {
            let rows = sqlx::query(
                r#"
                SELECT * FROM pipeline_predictions
                WHERE ($1::TEXT IS NULL OR item_id = $1)
                  AND ($2::BIGINT IS NULL OR EXTRACT(EPOCH FROM horizon_end - horizon_start)::BIGINT = $2)
                ORDER BY produced_at DESC, item_id ASC
                LIMIT $3
                "#,
            )
            .bind(query.item_id.as_ref().map(|i| i.as_str()))
            .bind(query.horizon_secs)
            .bind(limit as i64)
            .fetch_all(self.pg.pool())
            .await
            .map_err(|e| map_sqlx_error("prediction_history", e))?;
            rows.iter().map(prediction_from_row).collect()
        })
    }

    #[instrument(skip(self, candidate), fields(dedup_key = %candidate.dedup_key), err)]
    fn upsert_alert(&self, candidate: AlertCandidate) -> PipelineResult<UpsertOutcome> {
        self.pg.block_on(self.upsert_alert_async(candidate, self.alert_ttl))
    }

    fn get_alert(&self, id: AlertId) -> PipelineResult<Option<AlertRecord>> {
        self.pg.block_on(async {
            sqlx::query(&format!("SELECT {ALERT_COLUMNS} FROM pipeline_alerts WHERE id = $1"))
                .bind(*id.as_uuid())
                .fetch_optional(self.pg.pool())
                .await
                .map_err(|e| map_sqlx_error("get_alert", e))?
                .map(|row| alert_from_row(&row))
                .transpose()
        })
    }

    fn list_alerts(&self, filter: &AlertFilter) -> PipelineResult<Vec<AlertRecord>> {
        self.pg.block_on(self.list_alerts_async(filter))
    }

    fn acknowledge_alert(
        &self,
        id: AlertId,
        by: Option<String>,
        at: DateTime<Utc>,
    ) -> PipelineResult<Option<AlertRecord>> {
        self.pg.block_on(async {
            sqlx::query(
                r#"
                UPDATE pipeline_alerts SET
                    acknowledged = TRUE, acknowledged_at = $2, acknowledged_by = $3
                WHERE id = $1 AND NOT acknowledged
                "#,
            )
            .bind(*id.as_uuid())
            .bind(at)
            .bind(by)
            .execute(self.pg.pool())
            .await
            .map_err(|e| map_sqlx_error("acknowledge_alert", e))?;
            Ok(())
        })?;
        self.get_alert(id)
    }

    fn close_alert(
        &self,
        id: AlertId,
        resolution: Resolution,
        by: Option<String>,
        at: DateTime<Utc>,
    ) -> PipelineResult<Option<AlertRecord>> {
        self.pg.block_on(async {
            sqlx::query(
                r#"
                UPDATE pipeline_alerts SET
                    resolution = $2, resolved_at = $3, resolved_by = $4
                WHERE id = $1 AND resolution IS NULL
                "#,
            )
            .bind(*id.as_uuid())
            .bind(resolution.as_str())
            .bind(at)
            .bind(by)
            .execute(self.pg.pool())
            .await
            .map_err(|e| map_sqlx_error("close_alert", e))?;
            Ok(())
        })?;
        self.get_alert(id)
    }

    fn expire_alerts(&self, now: DateTime<Utc>) -> PipelineResult<usize> {
        self.pg.block_on(async {
            let res = sqlx::query(
                "UPDATE pipeline_alerts SET expired = TRUE \
                 WHERE NOT acknowledged AND NOT expired AND resolution IS NULL AND expires_at <= $1",
            )
            .bind(now)
            .execute(self.pg.pool())
            .await
            .map_err(|e| map_sqlx_error("expire_alerts", e))?;
            Ok(res.rows_affected() as usize)
        })
    }

    fn alert_stats(&self) -> PipelineResult<AlertStats> {
        let all = self.list_alerts(&AlertFilter::default())?;
        Ok(AlertStats::from_records(&all))
    }

    fn raise_operational(&self, alert: OperationalAlert) -> PipelineResult<()> {
        self.pg.block_on(async {
            sqlx::query(
                r#"
                INSERT INTO pipeline_operational_alerts (id, severity, source, job_id, message, raised_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(*alert.id.as_uuid())
            .bind(alert.severity.as_str())
            .bind(&alert.source)
            .bind(alert.job_id.map(uuid::Uuid::from))
            .bind(&alert.message)
            .bind(alert.raised_at)
            .execute(self.pg.pool())
            .await
            .map_err(|e| map_sqlx_error("raise_operational", e))?;
            Ok(())
        })
    }

    fn list_operational(&self, limit: usize) -> PipelineResult<Vec<OperationalAlert>> {
        self.pg.block_on(async {
            let rows = sqlx::query(
                "SELECT * FROM pipeline_operational_alerts ORDER BY raised_at DESC, id DESC LIMIT $1",
            )
            .bind(limit as i64)
            .fetch_all(self.pg.pool())
            .await
            .map_err(|e| map_sqlx_error("list_operational", e))?;
            rows.iter().map(operational_from_row).collect()
        })
    }

    fn evaluation_cursors(&self) -> PipelineResult<Cursors> {
        self.pg.block_on(async {
            let rows = sqlx::query("SELECT item_id, horizon_secs, produced_at FROM pipeline_evaluation_cursors")
                .fetch_all(self.pg.pool())
                .await
                .map_err(|e| map_sqlx_error("evaluation_cursors", e))?;
            let op = "decode_cursor";
            let mut cursors = Cursors::new();
            for row in rows {
                cursors.insert(
                    CursorKey {
                        item_id: ItemId::new(decode::<String>(op, row.try_get("item_id"))?),
                        horizon_secs: decode(op, row.try_get("horizon_secs"))?,
                    },
                    decode(op, row.try_get("produced_at"))?,
                );
            }
            Ok(cursors)
        })
    }

    fn advance_cursors(&self, advanced: &Cursors) -> PipelineResult<()> {
        if advanced.is_empty() {
            return Ok(());
        }
        self.pg.block_on(async {
            let mut tx = self
                .pg
                .pool()
                .begin()
                .await
                .map_err(|e| map_sqlx_error("advance_cursors", e))?;
            for (key, at) in advanced {
                sqlx::query(
                    r#"
                    INSERT INTO pipeline_evaluation_cursors (item_id, horizon_secs, produced_at)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (item_id, horizon_secs)
                    DO UPDATE SET produced_at = GREATEST(pipeline_evaluation_cursors.produced_at, EXCLUDED.produced_at)
                    "#,
                )
                .bind(key.item_id.as_str())
                .bind(key.horizon_secs)
                .bind(*at)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("advance_cursors", e))?;
            }
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("advance_cursors", e))?;
            Ok(())
        })
    }
}
