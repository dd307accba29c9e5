use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use crate::app::services::{run_blocking, AppServices};
use crate::app::{dto, errors};

/// Age past which a prediction is flagged stale: two refresh periods.
fn stale_after(services: &AppServices) -> chrono::Duration {
    let period = services.settings.intervals.predict_interval() * 2;
    chrono::Duration::from_std(period).unwrap_or(chrono::Duration::hours(2))
}

/// Last successful prediction per item/horizon, served even while refreshes fail.
pub async fn latest(
    Extension(services): Extension<Arc<AppServices>>,
    Query(params): Query<dto::PredictionsParams>,
) -> axum::response::Response {
    let query = params.query();
    let sink = services.sink.clone();
    let records = match run_blocking(move || sink.latest_predictions(&query)).await {
        Ok(r) => r,
        Err(e) => return errors::pipeline_error_to_response(e),
    };

    let now = services.clock.now();
    let stale_after = stale_after(&services);
    let items: Vec<serde_json::Value> = records
        .iter()
        .map(|r| dto::prediction_to_json(r, now, stale_after))
        .collect();

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "count": items.len(),
            "predictions": items,
        })),
    )
        .into_response()
}

pub async fn history(
    Extension(services): Extension<Arc<AppServices>>,
    Query(params): Query<dto::PredictionsParams>,
) -> axum::response::Response {
    let query = params.query();
    let limit = dto::limit(params.limit);
    let sink = services.sink.clone();
    let records = match run_blocking(move || sink.prediction_history(&query, limit)).await {
        Ok(r) => r,
        Err(e) => return errors::pipeline_error_to_response(e),
    };

    let now = services.clock.now();
    let stale_after = stale_after(&services);
    let items: Vec<serde_json::Value> = records
        .iter()
        .map(|r| dto::prediction_to_json(r, now, stale_after))
        .collect();

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "count": items.len(),
            "predictions": items,
        })),
    )
        .into_response()
}
