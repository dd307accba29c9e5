use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use shoptrack_core::{ConfigError, PipelineError};

pub fn pipeline_error_to_response(err: PipelineError) -> axum::response::Response {
    match err {
        PipelineError::StoreUnavailable(msg) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", msg)
        }
        PipelineError::Timeout(d) => json_error(
            StatusCode::GATEWAY_TIMEOUT,
            "timeout",
            format!("timed out after {d:?}"),
        ),
        PipelineError::DataInsufficient(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "data_insufficient", msg)
        }
        PipelineError::CorruptSnapshot(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "corrupt_snapshot", msg)
        }
        PipelineError::ModelUnavailable => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "model_unavailable",
            "no model has been published yet",
        ),
        PipelineError::InvariantViolation(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "invariant_violation", msg)
        }
        PipelineError::InvalidInput(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_input", msg),
    }
}

pub fn config_error_to_response(err: ConfigError) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "invalid_config", err.to_string())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
