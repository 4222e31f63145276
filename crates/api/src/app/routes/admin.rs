use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::{Extension, Path},
    http::StatusCode,
    routing::post,
};

use crate::app::routes::uploads::accepted_response;
use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::{PrincipalContext, RequestCorrelation};

pub fn router() -> Router {
    Router::new().route("/uploads/:file_id/reprocess", post(reprocess_upload))
}

/// The body is optional; when present it must be a JSON object.
pub async fn reprocess_upload(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Extension(correlation): Extension<RequestCorrelation>,
    Path(file_id): Path<String>,
    body: Bytes,
) -> axum::response::Response {
    let request: dto::ReprocessRequest = if body.iter().all(u8::is_ascii_whitespace) {
        dto::ReprocessRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
        }
    };

    match services
        .orchestrator()
        .request_reprocess(&principal, &file_id, request.reason, &correlation)
        .await
    {
        Ok(accepted) => accepted_response(accepted),
        Err(e) => errors::upload_error_to_response(e),
    }
}
