use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use tracing::{Instrument, debug, info_span};

use uploadflow_auth::JwtValidator;
use uploadflow_core::IdGenerator;

use crate::app::errors::json_error;
use crate::context::{PrincipalContext, RequestCorrelation};

pub const CORRELATION_HEADER: HeaderName = HeaderName::from_static("x-correlation-id");

#[derive(Clone)]
pub struct AuthState {
    pub jwt: Arc<dyn JwtValidator>,
}

pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(token) = extract_bearer(req.headers()) else {
        return json_error(StatusCode::UNAUTHORIZED, "unauthorized", "missing bearer token");
    };

    let claims = match state.jwt.validate(token, Utc::now()) {
        Ok(claims) => claims,
        Err(e) => {
            debug!(error = %e, "rejecting bearer token");
            return json_error(StatusCode::UNAUTHORIZED, "unauthorized", "invalid bearer token");
        }
    };

    req.extensions_mut().insert(PrincipalContext::from_claims(claims));
    next.run(req).await
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let header = headers.get(axum::http::header::AUTHORIZATION)?;
    let header = header.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

#[derive(Clone)]
pub struct CorrelationState {
    pub ids: Arc<dyn IdGenerator>,
}

/// Resolve the request's correlation id, run the rest of the stack inside a
/// span carrying it, and echo it in the response unless a handler already set
/// a more specific one.
pub async fn correlation_middleware(
    State(state): State<CorrelationState>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let header = req
        .headers()
        .get(&CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok());
    let correlation = RequestCorrelation::resolve(header, &*state.ids);

    let span = info_span!(
        "request",
        method = %req.method(),
        path = %req.uri().path(),
        correlation_id = %correlation.effective()
    );
    let echo = correlation.effective().to_string();
    req.extensions_mut().insert(correlation);

    let mut response = next.run(req).instrument(span).await;
    if !response.headers().contains_key(&CORRELATION_HEADER) {
        if let Ok(value) = HeaderValue::from_str(&echo) {
            response.headers_mut().insert(CORRELATION_HEADER, value);
        }
    }
    response
}
