use chrono::{DateTime, Utc};
use serde::Deserialize;

use shoptrack_ai::{ModelArtifact, PredictionRecord};
use shoptrack_alerts::{AlertFilter, AlertKind, AlertStatus};
use shoptrack_core::{ItemId, PipelineError, PipelineResult};
use shoptrack_infra::PredictionQuery;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Default, Deserialize)]
pub struct PredictionsParams {
    pub item_id: Option<String>,
    /// Horizon length in hours.
    pub horizon: Option<u32>,
    pub limit: Option<usize>,
}

impl PredictionsParams {
    pub fn query(&self) -> PredictionQuery {
        PredictionQuery {
            item_id: self.item_id.as_deref().map(ItemId::new),
            horizon_secs: self.horizon.map(|h| i64::from(h) * 3600),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AlertsParams {
    pub status: Option<String>,
    pub kind: Option<String>,
    pub item_id: Option<String>,
}

impl AlertsParams {
    pub fn filter(&self) -> PipelineResult<AlertFilter> {
        Ok(AlertFilter {
            status: self.status.as_deref().map(str::parse::<AlertStatus>).transpose()?,
            kind: self.kind.as_deref().map(str::parse::<AlertKind>).transpose()?,
            item_id: self.item_id.as_deref().map(ItemId::new),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AcknowledgeRequest {
    pub acknowledged_by: Option<String>,
}

/// Body of `POST /alerts/:id/resolve` and `/alerts/:id/dismiss`.
#[derive(Debug, Default, Deserialize)]
pub struct CloseAlertRequest {
    pub by: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct JobsParams {
    pub status: Option<String>,
    pub kind: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct SaleLine {
    pub item_id: String,
    pub quantity: i64,
    /// Defaults to the time the request is handled.
    pub sold_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct IngestSalesRequest {
    pub sales: Vec<SaleLine>,
}

#[derive(Debug, Deserialize)]
pub struct SetStockRequest {
    pub quantity: i64,
}

pub const DEFAULT_LIMIT: usize = 100;
pub const MAX_LIMIT: usize = 1000;

pub fn limit(requested: Option<usize>) -> usize {
    requested.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

pub fn parse_item_id(raw: &str) -> PipelineResult<ItemId> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::invalid_input("item id must not be empty"));
    }
    Ok(ItemId::new(trimmed))
}

// -------------------------
// Response mapping
// -------------------------

/// A prediction annotated with its age; `stale` once older than `stale_after`.
pub fn prediction_to_json(
    record: &PredictionRecord,
    now: DateTime<Utc>,
    stale_after: chrono::Duration,
) -> serde_json::Value {
    let age = now - record.produced_at;
    serde_json::json!({
        "item_id": record.item_id,
        "horizon_start": record.horizon_start,
        "horizon_end": record.horizon_end,
        "score": record.score,
        "expected_demand": record.expected_demand,
        "confidence": record.confidence,
        "produced_by_model_version": record.produced_by_model_version.0,
        "produced_at": record.produced_at,
        "age_secs": age.num_seconds().max(0),
        "stale": age > stale_after,
    })
}

pub fn artifact_to_json(artifact: &ModelArtifact) -> serde_json::Value {
    serde_json::json!({
        "version": artifact.version.0,
        "forecaster": artifact.forecaster,
        "trained_at": artifact.trained_at,
        "location": artifact.location,
        "metrics": artifact.metrics,
        "source_job": artifact.source_job.map(|j| j.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use shoptrack_core::ModelVersion;

    #[test]
    fn prediction_age_and_staleness() {
        let produced = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let record = PredictionRecord {
            item_id: ItemId::new("sku-1"),
            horizon_start: produced,
            horizon_end: produced + chrono::Duration::hours(24),
            score: 0.4,
            expected_demand: 12.0,
            confidence: 0.9,
            produced_by_model_version: ModelVersion(3),
            produced_at: produced,
        };

        let fresh = prediction_to_json(&record, produced + chrono::Duration::minutes(30), chrono::Duration::hours(2));
        assert_eq!(fresh["age_secs"], 1800);
        assert_eq!(fresh["stale"], false);
        assert_eq!(fresh["produced_by_model_version"], 3);

        let old = prediction_to_json(&record, produced + chrono::Duration::hours(5), chrono::Duration::hours(2));
        assert_eq!(old["stale"], true);
    }

    #[test]
    fn alert_filter_rejects_unknown_status() {
        let params = AlertsParams {
            status: Some("snoozed".into()),
            ..Default::default()
        };
        assert!(params.filter().is_err());

        let params = AlertsParams {
            status: Some("active".into()),
            kind: Some("low_stock".into()),
            item_id: None,
        };
        let filter = params.filter().unwrap();
        assert_eq!(filter.status, Some(AlertStatus::Active));
        assert_eq!(filter.kind, Some(AlertKind::LowStock));

        let params = AlertsParams {
            status: Some("dismissed".into()),
            ..Default::default()
        };
        assert_eq!(params.filter().unwrap().status, Some(AlertStatus::Dismissed));
    }

    #[test]
    fn limits_are_clamped() {
        assert_eq!(limit(None), DEFAULT_LIMIT);
        assert_eq!(limit(Some(0)), 1);
        assert_eq!(limit(Some(50_000)), MAX_LIMIT);
    }
}
