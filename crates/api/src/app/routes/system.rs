use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use crate::app::errors;
use crate::app::services::{run_blocking, AppServices};

/// Liveness summary: scheduler heartbeat, pool size and the current model.
pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let models = services.models.clone();
    let model = match run_blocking(move || Ok((models.current()?, models.halted()?))).await {
        Ok(m) => m,
        Err(e) => return errors::pipeline_error_to_response(e),
    };
    let (current, halted) = model;

    let scheduler_alive = services.scheduler_alive();
    let status = if scheduler_alive { "ok" } else { "degraded" };

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": status,
            "scheduler_alive": scheduler_alive,
            "worker_pool_size": services.settings.workers.pool_size,
            "current_model_version": current.map(|a| a.version.0),
            "publishing_halted": halted,
            "workers": services.worker_stats(),
        })),
    )
        .into_response()
}
