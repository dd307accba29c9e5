use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use shoptrack_alerts::Resolution;
use shoptrack_core::AlertId;

use crate::app::services::{run_blocking, AppServices};
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_alerts))
        .route("/stats", get(alert_stats))
        .route("/operational", get(list_operational))
        .route("/:id", get(get_alert))
        .route("/:id/ack", post(acknowledge))
        .route("/:id/resolve", post(resolve))
        .route("/:id/dismiss", post(dismiss))
}

fn parse_alert_id(raw: &str) -> Result<AlertId, axum::response::Response> {
    raw.parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid alert id"))
}

pub async fn list_alerts(
    Extension(services): Extension<Arc<AppServices>>,
    Query(params): Query<dto::AlertsParams>,
) -> axum::response::Response {
    let filter = match params.filter() {
        Ok(f) => f,
        Err(e) => return errors::pipeline_error_to_response(e),
    };
    let sink = services.sink.clone();
    match run_blocking(move || sink.list_alerts(&filter)).await {
        Ok(alerts) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "count": alerts.len(),
                "alerts": alerts,
            })),
        )
            .into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn get_alert(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_alert_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let sink = services.sink.clone();
    match run_blocking(move || sink.get_alert(id)).await {
        Ok(Some(alert)) => (StatusCode::OK, Json(alert)).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "alert not found"),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

/// Acknowledge an alert. Repeating the call is harmless.
pub async fn acknowledge(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    body: Option<Json<dto::AcknowledgeRequest>>,
) -> axum::response::Response {
    let id = match parse_alert_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let by = body.and_then(|Json(b)| b.acknowledged_by);
    let at = services.clock.now();
    let sink = services.sink.clone();
    match run_blocking(move || sink.acknowledge_alert(id, by, at)).await {
        Ok(Some(alert)) => {
            tracing::info!(alert_id = %alert.id, "alert acknowledged");
            (StatusCode::OK, Json(alert)).into_response()
        }
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "alert not found"),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn resolve(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    body: Option<Json<dto::CloseAlertRequest>>,
) -> axum::response::Response {
    close(services, id, Resolution::Resolved, body).await
}

pub async fn dismiss(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    body: Option<Json<dto::CloseAlertRequest>>,
) -> axum::response::Response {
    close(services, id, Resolution::Dismissed, body).await
}

/// Close an alert. A second close keeps the first resolution and returns it.
async fn close(
    services: Arc<AppServices>,
    id: String,
    resolution: Resolution,
    body: Option<Json<dto::CloseAlertRequest>>,
) -> axum::response::Response {
    let id = match parse_alert_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let by = body.and_then(|Json(b)| b.by);
    let at = services.clock.now();
    let sink = services.sink.clone();
    match run_blocking(move || sink.close_alert(id, resolution, by, at)).await {
        Ok(Some(alert)) => {
            tracing::info!(alert_id = %alert.id, status = alert.status().as_str(), "alert closed");
            (StatusCode::OK, Json(alert)).into_response()
        }
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "alert not found"),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn alert_stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let sink = services.sink.clone();
    match run_blocking(move || sink.alert_stats()).await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

/// Operational alerts: abandoned jobs, superseded runs, invariant violations.
pub async fn list_operational(
    Extension(services): Extension<Arc<AppServices>>,
    Query(params): Query<dto::LimitParams>,
) -> axum::response::Response {
    let limit = dto::limit(params.limit);
    let sink = services.sink.clone();
    match run_blocking(move || sink.list_operational(limit)).await {
        Ok(alerts) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "count": alerts.len(),
                "alerts": alerts,
            })),
        )
            .into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}
