//! Tower middleware wrapped around the gateway router

use crate::proxy::headers::X_REQUEST_ID;
use crate::proxy::types::RequestId;
use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};
use std::time::Instant;
use tracing::info;

/// Request ID middleware - ensures every request has a unique ID for tracing
///
/// A valid inbound `x-request-id` is kept. Anything else is replaced with a
/// fresh v7 UUID. The id travels to the gateway as a request extension.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|h| h.to_str().ok())
        .and_then(RequestId::parse)
        .unwrap_or_else(RequestId::generate);

    let header_value = HeaderValue::try_from(request_id.to_string()).ok();
    if let Some(value) = &header_value {
        request.headers_mut().insert(X_REQUEST_ID, value.clone());
    }
    request.extensions_mut().insert(request_id);

    let mut response = next.run(request).await;

    if let Some(value) = header_value {
        response.headers_mut().entry(X_REQUEST_ID).or_insert(value);
    }
    response
}

/// Logging middleware - logs request/response details with timing
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(ToString::to_string)
        .unwrap_or_else(|| "unknown".to_string());

    info!(
        request_id = request_id,
        method = %method,
        path = %path,
        "Incoming request"
    );

    let response = next.run(request).await;

    // Streaming bodies are still flowing at this point, so the duration is
    // time to response headers
    info!(
        request_id = request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis(),
        "Request completed"
    );

    response
}
