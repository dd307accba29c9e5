use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{post, put},
    Json, Router,
};

use shoptrack_ai::SalesRecord;
use shoptrack_core::PipelineResult;

use crate::app::services::{run_blocking, AppServices};
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/sales", post(record_sales))
        .route("/stock/:item_id", put(set_stock))
}

fn read_only() -> axum::response::Response {
    errors::json_error(
        StatusCode::CONFLICT,
        "ingest_unavailable",
        "sales and stock are read from the database; ingest is disabled",
    )
}

pub async fn record_sales(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::IngestSalesRequest>,
) -> axum::response::Response {
    let Some(data) = services.data.ingest().cloned() else {
        return read_only();
    };

    let now = services.clock.now();
    let sales: PipelineResult<Vec<SalesRecord>> = body
        .sales
        .into_iter()
        .map(|line| {
            Ok(SalesRecord {
                item_id: dto::parse_item_id(&line.item_id)?,
                sold_at: line.sold_at.unwrap_or(now),
                quantity: line.quantity,
            })
        })
        .collect();
    let sales = match sales {
        Ok(s) => s,
        Err(e) => return errors::pipeline_error_to_response(e),
    };
    // Validate the whole batch before writing any of it.
    if let Some(bad) = sales.iter().find(|s| s.quantity <= 0) {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_input",
            format!("sale quantity must be positive, got {} for {}", bad.quantity, bad.item_id),
        );
    }

    match run_blocking(move || data.record_sales(sales)).await {
        Ok(recorded) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "recorded": recorded })),
        )
            .into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn set_stock(
    Extension(services): Extension<Arc<AppServices>>,
    Path(item_id): Path<String>,
    Json(body): Json<dto::SetStockRequest>,
) -> axum::response::Response {
    let Some(data) = services.data.ingest().cloned() else {
        return read_only();
    };
    let item_id = match dto::parse_item_id(&item_id) {
        Ok(i) => i,
        Err(e) => return errors::pipeline_error_to_response(e),
    };

    let quantity = body.quantity;
    let id = item_id.clone();
    match run_blocking(move || data.set_stock(id, quantity)).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "item_id": item_id,
                "quantity": quantity,
            })),
        )
            .into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}
