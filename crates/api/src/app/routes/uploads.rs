use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, Query, rejection::JsonRejection},
    http::{HeaderValue, StatusCode},
    response::IntoResponse,
};

use crate::app::orchestration::{Accepted, NewUpload};
use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::{PrincipalContext, RequestCorrelation};
use crate::middleware::CORRELATION_HEADER;

pub async fn create_upload(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Extension(correlation): Extension<RequestCorrelation>,
    body: Result<Json<dto::CreateUploadRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection_to_response(rejection),
    };

    let upload = match NewUpload::validate(body.file_id, &body.file_name, &body.content_type, body.size_bytes) {
        Ok(upload) => upload,
        Err(e) => return errors::upload_error_to_response(e.into()),
    };

    match services
        .orchestrator()
        .request_upload(&principal, upload, &correlation)
        .await
    {
        Ok(accepted) => accepted_response(accepted),
        Err(e) => errors::upload_error_to_response(e),
    }
}

pub async fn list_uploads(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Query(query): Query<dto::ListUploadsQuery>,
) -> axum::response::Response {
    match services
        .orchestrator()
        .list_uploads(&principal, query.user_id.as_deref())
    {
        Ok(items) => Json(dto::UploadListResponse::from(items)).into_response(),
        Err(e) => errors::upload_error_to_response(e),
    }
}

pub async fn upload_status(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(file_id): Path<String>,
) -> axum::response::Response {
    match services.orchestrator().upload_status(&principal, &file_id) {
        Ok(record) => Json(record).into_response(),
        Err(e) => errors::upload_error_to_response(e),
    }
}

/// `202 Accepted` with the command's correlation id echoed as a header.
pub(crate) fn accepted_response(accepted: Accepted) -> axum::response::Response {
    let header = HeaderValue::from_str(&accepted.correlation_id).ok();
    let mut response = (StatusCode::ACCEPTED, Json(accepted)).into_response();
    if let Some(value) = header {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}
