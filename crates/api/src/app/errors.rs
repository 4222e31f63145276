use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::{error, warn};

use uploadflow_core::DomainError;
use uploadflow_infra::PublishError;
use uploadflow_infra::lifecycle::StoreError;

use crate::app::orchestration::UploadError;

pub fn upload_error_to_response(err: UploadError) -> axum::response::Response {
    match err {
        UploadError::Domain(DomainError::Validation(msg)) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", msg)
        }
        UploadError::Domain(DomainError::NotFound) => json_error(StatusCode::NOT_FOUND, "not_found", "upload not found"),
        UploadError::Domain(DomainError::Forbidden(msg)) => json_error(StatusCode::FORBIDDEN, "forbidden", msg),
        UploadError::Domain(DomainError::Conflict(msg)) => json_error(StatusCode::CONFLICT, "conflict", msg),
        UploadError::Naming(e) => {
            error!(error = %e, "routing key construction failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "naming_error", e.to_string())
        }
        UploadError::Envelope(e) => {
            error!(error = %e, "envelope construction failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "envelope_error", e.to_string())
        }
        UploadError::Publish(PublishError::Encode(msg)) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "encode_error", msg)
        }
        UploadError::Publish(PublishError::Connectivity(msg)) => {
            warn!(%msg, "broker unavailable");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "broker_unavailable", msg)
        }
        UploadError::Publish(PublishError::Delivery(msg)) => {
            warn!(%msg, "command not confirmed");
            json_error(StatusCode::BAD_GATEWAY, "delivery_failed", msg)
        }
        UploadError::Store(StoreError::Unavailable(msg)) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", msg)
        }
        UploadError::Store(StoreError::NotOwner { file_id }) => {
            warn!(%file_id, "upload command published but record owned by another user");
            json_error(StatusCode::NOT_FOUND, "not_found", "upload not found")
        }
    }
}

/// Malformed or mistyped JSON bodies are client input faults.
pub fn json_rejection_to_response(rejection: JsonRejection) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "validation_error", rejection.body_text())
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
