//! Bearer API key check for the client-facing routes

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use common::Secret;
use tracing::debug;

use crate::error::Error;

/// Accepts `Authorization: Bearer <key>` (the bare key is accepted too).
pub async fn require_api_key(
    State(api_key): State<Arc<Secret<String>>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(header) = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        debug!(path = %request.uri().path(), "request without authorization header");
        return Error::Unauthorized("Missing or invalid Authorization header").into_response();
    };

    let presented = header.strip_prefix("Bearer ").unwrap_or(header);
    if presented != api_key.expose().as_str() {
        debug!(path = %request.uri().path(), "request with wrong api key");
        return Error::Unauthorized("Invalid API key").into_response();
    }

    next.run(request).await
}
