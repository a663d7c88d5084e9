//! Failure attribution and the single client-visible error response
//!
//! Whatever stage failed, the client gets one JSON envelope and the request's
//! audit record is flushed exactly once. Request-stage failures default to
//! 400, response-stage failures to 500, unless the cause carries an
//! [`HttpError`], whose status and payload are used as-is.

use crate::log_messages::request_processing;
use crate::proxy::audit::{keys, AuditSink, AuditWriter};
use crate::proxy::context::RequestContext;
use crate::proxy::error_response::ErrorResponseExt;
use crate::proxy::filter::FilterError;
use crate::proxy::headers::{GATEWAY_NAME, X_GATEWAY, X_REQUEST_ID};
use crate::proxy::response_pipeline::{StreamCompletion, StreamReport};
use crate::proxy::splitter::SplitError;
use crate::proxy::types::ProxyError;
use async_trait::async_trait;
use axum::response::Response;
use http::{HeaderMap, HeaderValue, StatusCode};
use serde_json::{Map, Value};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, warn};

/// Key under which an upstream error body is relayed to the client
pub const RAW_BACKEND_RESPONSE: &str = "raw_llm_backend_response";

/// Which pipeline a failure happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Request,
    Response,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Request => "request",
            Self::Response => "response",
        })
    }
}

/// An error that already knows its HTTP status and payload
#[derive(Debug, Clone, PartialEq)]
pub struct HttpError {
    pub status: StatusCode,
    pub message: String,
    pub extra: Map<String, Value>,
}

impl HttpError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            extra: Map::new(),
        }
    }

    pub fn with_extra(mut self, extra: Map<String, Value>) -> Self {
        self.extra = extra;
        self
    }

    /// Wrap a failed upstream response, relaying its body as JSON when it parses
    pub fn upstream(status: StatusCode, body: &[u8]) -> Self {
        let raw = serde_json::from_slice::<Value>(body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()));
        let mut extra = Map::new();
        extra.insert(RAW_BACKEND_RESPONSE.to_string(), raw);
        Self::new(status, format!("upstream returned {status}")).with_extra(extra)
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HttpError {}

/// What actually went wrong inside a pipeline
#[derive(Error, Debug)]
pub enum PipelineCause {
    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Split(#[from] SplitError),

    #[error(transparent)]
    Upstream(HttpError),

    #[error("upstream body read failed: {0}")]
    Body(String),

    #[error("panic: {0}")]
    Panic(String),
}

impl PipelineCause {
    /// Build a cause from a caught panic payload
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::Panic(message)
    }
}

/// A pipeline failure attributed to a stage and, when known, a filter
#[derive(Debug)]
pub struct PipelineError {
    pub stage: Stage,
    pub filter: Option<String>,
    pub cause: PipelineCause,
}

impl PipelineError {
    pub fn new(stage: Stage, filter: Option<String>, cause: PipelineCause) -> Self {
        Self {
            stage,
            filter,
            cause,
        }
    }

    /// The structured HTTP error carried by the cause, if any
    pub fn http_error(&self) -> Option<&HttpError> {
        match &self.cause {
            PipelineCause::Upstream(http) | PipelineCause::Filter(FilterError::Http(http)) => {
                Some(http)
            }
            _ => None,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.http_error() {
            Some(http) => http.status,
            None => match self.stage {
                Stage::Request => StatusCode::BAD_REQUEST,
                Stage::Response => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.filter {
            Some(filter) if !filter.is_empty() => write!(f, "{filter}: {}", self.cause),
            _ => write!(f, "{}", self.cause),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

/// Turns failures into client responses and owns the final audit flush
#[derive(Clone)]
pub struct ErrorBoundary {
    audit_writer: Arc<dyn AuditWriter>,
}

impl ErrorBoundary {
    pub fn new(audit_writer: Arc<dyn AuditWriter>) -> Self {
        Self { audit_writer }
    }

    /// Respond to a failure that happened before any response body was sent
    pub async fn respond(&self, ctx: &RequestContext, error: ProxyError) -> Response {
        let status = error.status_code();
        note_proxy_error(ctx, &error, status);

        if status.is_server_error() {
            error!(request_id = %ctx.request_id(), route = ctx.route(), %status, error = %error, "{}", request_processing::REQUEST_FAILED);
        } else {
            warn!(request_id = %ctx.request_id(), route = ctx.route(), %status, error = %error, "{}", request_processing::REQUEST_REJECTED);
        }

        let mut response = error
            .to_error_response()
            .with_request_id(ctx.request_id().to_string())
            .into_response_with_status(status);
        Self::stamp(response.headers_mut(), ctx);

        ctx.flush_audit(self.audit_writer.as_ref()).await;
        response
    }

    /// Set the gateway-identifying headers
    pub fn stamp(headers: &mut HeaderMap, ctx: &RequestContext) {
        headers.insert(X_GATEWAY, HeaderValue::from_static(GATEWAY_NAME));
        if let Ok(value) = HeaderValue::from_str(&ctx.request_id().to_string()) {
            headers.insert(X_REQUEST_ID, value);
        }
    }

    /// Flush the audit for a request that ended without a stream
    pub async fn flush(&self, ctx: &RequestContext) {
        ctx.flush_audit(self.audit_writer.as_ref()).await;
    }
}

#[async_trait]
impl StreamCompletion for ErrorBoundary {
    async fn stream_finished(&self, ctx: &RequestContext, report: &StreamReport) {
        let audit = ctx.audit();
        audit.note(keys::RESPONSE_OUTCOME, Value::from(report.outcome.to_string()));

        if let Some(err) = &report.error {
            ctx.record_error(Arc::clone(err));
            note_pipeline_error(ctx, err);
            warn!(
                request_id = %ctx.request_id(),
                route = ctx.route(),
                stage = %err.stage,
                filter = err.filter.as_deref().unwrap_or(""),
                error = %err,
                "{}",
                request_processing::STREAM_FAILED
            );
        }

        ctx.flush_audit(self.audit_writer.as_ref()).await;
    }
}

fn note_proxy_error(ctx: &RequestContext, error: &ProxyError, status: StatusCode) {
    let audit = ctx.audit();
    audit.note(keys::RESPONSE_STATUS, Value::from(status.as_u16()));
    match error {
        ProxyError::Pipeline(err) => note_pipeline_error(ctx, err),
        other => audit.note(keys::ERROR_MESSAGE, Value::from(other.to_string())),
    }
}

fn note_pipeline_error(ctx: &RequestContext, err: &PipelineError) {
    let audit = ctx.audit();
    audit.note(keys::ERROR_STAGE, Value::from(err.stage.to_string()));
    if let Some(filter) = &err.filter {
        audit.note(keys::ERROR_FILTER, Value::from(filter.as_str()));
    }
    audit.note(keys::ERROR_MESSAGE, Value::from(err.to_string()));
}
