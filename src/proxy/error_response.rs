//! Client-visible JSON error envelope
//!
//! Every error the gateway produces itself (as opposed to relaying the
//! upstream's bytes) uses this one shape, with the request ID echoed in
//! both the body and the `x-request-id` header.

use crate::proxy::error_boundary::{PipelineCause, Stage};
use crate::proxy::transport::TransportError;
use crate::proxy::types::{ProxyError, REQUEST_ID_HEADER};
use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Standard error response format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Unique error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Request ID for correlation
    pub request_id: Option<String>,
    /// Structured context, e.g. the upstream's own error body
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            request_id: None,
            details: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Convert to HTTP response with the request ID header
    pub fn into_response_with_status(self, status: StatusCode) -> Response {
        let request_id = self.request_id.clone();
        let mut response = (status, Json(self)).into_response();

        if let Some(id) = request_id {
            if let Ok(header_value) = HeaderValue::from_str(&id) {
                response
                    .headers_mut()
                    .insert(REQUEST_ID_HEADER, header_value);
            }
        }

        response
    }
}

/// Extension trait for consistent error formatting
pub trait ErrorResponseExt {
    fn to_error_response(&self) -> ErrorResponse;

    fn status_code(&self) -> StatusCode;
}

impl ErrorResponseExt for ProxyError {
    fn to_error_response(&self) -> ErrorResponse {
        use ProxyError::*;

        match self {
            RequestTooLarge { .. } => ErrorResponse::new("REQUEST_TOO_LARGE", self.to_string()),
            NoRoute(_) => ErrorResponse::new("NO_ROUTE", self.to_string()),
            InvalidTargetUrl(_) => ErrorResponse::new("INVALID_TARGET_URL", self.to_string()),
            Transport(TransportError::Timeout(_)) => {
                ErrorResponse::new("UPSTREAM_TIMEOUT", self.to_string())
            }
            Transport(_) => ErrorResponse::new("UPSTREAM_UNAVAILABLE", self.to_string()),
            Pipeline(err) => match err.http_error() {
                Some(http) => {
                    let code = match err.cause {
                        PipelineCause::Upstream(_) => "UPSTREAM_ERROR",
                        _ => "FILTER_REJECTED",
                    };
                    ErrorResponse::new(code, http.message.clone())
                        .with_details(serde_json::Value::Object(http.extra.clone()))
                }
                None => {
                    let code = match err.stage {
                        Stage::Request => "REQUEST_FILTER_FAILED",
                        Stage::Response => "RESPONSE_FILTER_FAILED",
                    };
                    ErrorResponse::new(code, err.to_string()).with_details(json!({
                        "stage": err.stage.to_string(),
                        "filter": err.filter,
                    }))
                }
            },
            Internal(msg) => ErrorResponse::new("INTERNAL_ERROR", msg.clone()),
        }
    }

    fn status_code(&self) -> StatusCode {
        use ProxyError::*;

        match self {
            RequestTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            NoRoute(_) => StatusCode::NOT_FOUND,
            InvalidTargetUrl(_) => StatusCode::BAD_GATEWAY,
            Transport(TransportError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            Transport(_) => StatusCode::BAD_GATEWAY,
            Pipeline(err) => err.status(),
            Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error conversion for Axum responses using the standard envelope
impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        self.to_error_response().into_response_with_status(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::error_boundary::{HttpError, PipelineCause, PipelineError};
    use crate::proxy::filter::FilterError;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_error_response_builder() {
        let error = ErrorResponse::new("TEST_ERROR", "Test error")
            .with_request_id("req-123")
            .with_details(json!({ "field": "value" }));
        assert_eq!(error.request_id, Some("req-123".to_string()));
        assert!(error.details.is_some());
    }

    #[test]
    fn test_into_response_sets_request_id_header() {
        let response = ErrorResponse::new("X", "y")
            .with_request_id("req-123")
            .into_response_with_status(StatusCode::NOT_FOUND);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "req-123");
    }

    #[test]
    fn test_request_filter_failure_envelope() {
        let error = ProxyError::from(Arc::new(PipelineError::new(
            Stage::Request,
            Some("model_lookup".to_string()),
            PipelineCause::Filter(FilterError::message("unknown model")),
        )));

        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
        let envelope = error.to_error_response();
        assert_eq!(envelope.code, "REQUEST_FILTER_FAILED");
        assert_eq!(envelope.message, "model_lookup: unknown model");
        assert_eq!(envelope.details.unwrap()["filter"], "model_lookup");
    }

    #[test]
    fn test_structured_http_error_used_verbatim() {
        let mut extra = serde_json::Map::new();
        extra.insert("raw_llm_backend_response".to_string(), json!({"error": "x"}));
        let error = ProxyError::from(Arc::new(PipelineError::new(
            Stage::Response,
            None,
            PipelineCause::Upstream(HttpError::new(StatusCode::NOT_FOUND, "upstream returned 404").with_extra(extra)),
        )));

        assert_eq!(error.status_code(), StatusCode::NOT_FOUND);
        let envelope = error.to_error_response();
        assert_eq!(envelope.code, "UPSTREAM_ERROR");
        assert_eq!(envelope.message, "upstream returned 404");
        assert_eq!(
            envelope.details.unwrap()["raw_llm_backend_response"]["error"],
            "x"
        );
    }

    #[test]
    fn test_filter_rejection_keeps_filter_status() {
        let error = ProxyError::from(Arc::new(PipelineError::new(
            Stage::Request,
            Some("quota".to_string()),
            PipelineCause::Filter(FilterError::Http(HttpError::new(
                StatusCode::TOO_MANY_REQUESTS,
                "quota exceeded",
            ))),
        )));

        assert_eq!(error.status_code(), StatusCode::TOO_MANY_REQUESTS);
        let envelope = error.to_error_response();
        assert_eq!(envelope.code, "FILTER_REJECTED");
        assert_eq!(envelope.message, "quota exceeded");
    }

    #[test]
    fn test_transport_timeout_maps_to_gateway_timeout() {
        let error = ProxyError::from(TransportError::Timeout(Duration::from_secs(1)));
        assert_eq!(error.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(error.to_error_response().code, "UPSTREAM_TIMEOUT");
    }
}
