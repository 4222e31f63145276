use std::sync::Arc;

use axum::{Json, extract::Extension, response::IntoResponse};

use uploadflow_infra::PublisherState;

use crate::app::services::AppServices;
use crate::context::PrincipalContext;

/// Liveness plus the publisher's current broker state. The broker is
/// connected lazily, so `disconnected` alone is not unhealthy.
pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    let broker = match services.broker_state() {
        PublisherState::Disconnected => "disconnected",
        PublisherState::Connecting => "connecting",
        PublisherState::Ready => "ready",
        PublisherState::Draining => "draining",
    };
    Json(serde_json::json!({ "status": "ok", "broker": broker }))
}

pub async fn whoami(Extension(principal): Extension<PrincipalContext>) -> impl IntoResponse {
    Json(serde_json::json!({
        "userId": principal.user_id(),
        "userName": principal.user_name(),
        "roles": principal.roles().iter().map(|r| r.as_str()).collect::<Vec<_>>(),
        "isAdmin": principal.is_admin(),
    }))
}
