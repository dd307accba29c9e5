use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use shoptrack_core::{ModelVersion, ThresholdConfig};

use crate::app::services::{run_blocking, AppServices};
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/retrain", post(trigger_retrain))
        .route("/model", get(model_status))
        .route("/model/rollback/:version", post(rollback_model))
        .route("/model/resume", post(resume_publishing))
        .route("/thresholds", get(get_thresholds).put(put_thresholds))
        .route("/thresholds/reload", post(reload_thresholds))
}

/// Enqueue a manual RETRAIN. It waits behind any RETRAIN already running.
pub async fn trigger_retrain(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let scheduler = services.scheduler.clone();
    match run_blocking(move || scheduler.trigger_retrain()).await {
        Ok(job_id) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "job_id": job_id.to_string(),
                "kind": "RETRAIN",
            })),
        )
            .into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn model_status(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let models = services.models.clone();
    let status = run_blocking(move || Ok((models.current()?, models.versions()?, models.halted()?))).await;
    match status {
        Ok((current, versions, halted)) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "current": current.as_deref().map(dto::artifact_to_json),
                "retained_versions": versions.iter().map(|v| v.0).collect::<Vec<_>>(),
                "publishing_halted": halted,
            })),
        )
            .into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn rollback_model(
    Extension(services): Extension<Arc<AppServices>>,
    Path(version): Path<u64>,
) -> axum::response::Response {
    let models = services.models.clone();
    match run_blocking(move || models.rollback(ModelVersion(version))).await {
        Ok(artifact) => {
            tracing::warn!(version = %artifact.version, "model rolled back by operator");
            (StatusCode::OK, Json(dto::artifact_to_json(&artifact))).into_response()
        }
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

/// Clear a publishing halt raised by an invariant violation.
pub async fn resume_publishing(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let models = services.models.clone();
    match run_blocking(move || models.resume_publishing()).await {
        Ok(()) => {
            tracing::warn!("model publishing resumed by operator");
            (StatusCode::OK, Json(serde_json::json!({ "publishing_halted": null }))).into_response()
        }
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn get_thresholds(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    (StatusCode::OK, Json(services.thresholds.snapshot().as_ref().clone())).into_response()
}

/// Replace thresholds. Applies from the next evaluation cycle.
pub async fn put_thresholds(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<ThresholdConfig>,
) -> axum::response::Response {
    match services.thresholds.replace(body) {
        Ok(()) => (StatusCode::OK, Json(services.thresholds.snapshot().as_ref().clone())).into_response(),
        Err(e) => errors::config_error_to_response(e),
    }
}

pub async fn reload_thresholds(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.thresholds.reload_from_env() {
        Ok(cfg) => (StatusCode::OK, Json(cfg.as_ref().clone())).into_response(),
        Err(e) => errors::config_error_to_response(e),
    }
}
