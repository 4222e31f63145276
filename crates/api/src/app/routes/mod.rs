use axum::{
    Router,
    routing::{get, post},
};

pub mod admin;
pub mod system;
pub mod uploads;

/// Router for all authenticated endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .route("/uploads", post(uploads::create_upload).get(uploads::list_uploads))
        .route("/uploads/:file_id/status", get(uploads::upload_status))
        .nest("/admin", admin::router())
}
