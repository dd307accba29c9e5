use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use shoptrack_core::{JobId, PipelineError};
use shoptrack_infra::jobs::{JobKind, JobStatusFilter};

use crate::app::services::{run_blocking, AppServices};
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_jobs))
        .route("/stats", get(job_stats))
        .route("/:id", get(get_job))
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(params): Query<dto::JobsParams>,
) -> axum::response::Response {
    let status = match params.status.as_deref().map(str::parse::<JobStatusFilter>).transpose() {
        Ok(s) => s,
        Err(e) => return errors::pipeline_error_to_response(e),
    };
    let kind = match params.kind.as_deref().map(str::parse::<JobKind>).transpose() {
        Ok(k) => k,
        Err(e) => return errors::pipeline_error_to_response(e),
    };
    let limit = dto::limit(params.limit);

    let jobs = services.jobs.clone();
    let listed = run_blocking(move || {
        let mut listed = match kind {
            Some(kind) => jobs.list_by_kind(kind, usize::MAX)?,
            None => jobs.list_by_status(status, usize::MAX)?,
        };
        if let Some(status) = status {
            listed.retain(|j| status.matches(&j.status));
        }
        // Newest first.
        listed.reverse();
        listed.truncate(limit);
        Ok(listed)
    })
    .await;

    match listed {
        Ok(jobs) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "count": jobs.len(),
                "jobs": jobs,
            })),
        )
            .into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: JobId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"),
    };
    let jobs = services.jobs.clone();
    match run_blocking(move || jobs.get(id).map_err(PipelineError::from)).await {
        Ok(Some(job)) => (StatusCode::OK, Json(job)).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn job_stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let jobs = services.jobs.clone();
    match run_blocking(move || jobs.stats().map_err(PipelineError::from)).await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}
