//! Request rewrite pipeline
//!
//! ```text
//! BEGIN -> rewrite(filter 1) -> ... -> rewrite(filter n) -> END
//!            \______________________________________/
//!                         error or panic -> FAILED
//! ```
//!
//! Every filter receives the same pristine [`InboundRequest`] and the one
//! cumulative [`OutboundDraft`]. The inbound snapshot is only ever lent out
//! immutably, so one filter's edits can never leak into another filter's view
//! of the client request.

use crate::proxy::audit::{keys, AuditSink};
use crate::proxy::capture::truncate;
use crate::proxy::context::RequestContext;
use crate::proxy::dump::{Dump, DumpLogger};
use crate::proxy::error_boundary::{PipelineError, Stage};
use crate::proxy::filter::{guarded, NamedRewriter};
use crate::proxy::headers::{
    content_types, media_type, strip_hop_by_hop, CONTENT_LENGTH, HOST, X_SESSION_ID,
};
use crate::proxy::types::{CaptureConfig, ProxyError, ProxyResult, RequestSizeLimit};
use axum::body::Body;
use bytes::Bytes;
use http::{HeaderMap, Method, Request, Uri};
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Immutable snapshot of the client request, body captured once
#[derive(Debug, Clone)]
pub struct InboundRequest {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
}

impl InboundRequest {
    /// Read the whole request body, bounded by `limit`
    pub async fn capture(request: Request<Body>, limit: RequestSizeLimit) -> ProxyResult<Self> {
        let (parts, body) = request.into_parts();
        let body = http_body_util::Limited::new(body, *limit.as_ref())
            .collect()
            .await
            .map_err(|e| {
                if e.is::<http_body_util::LengthLimitError>() {
                    ProxyError::RequestTooLarge { max_size: limit }
                } else {
                    ProxyError::Internal(format!("Body collection error: {e}"))
                }
            })?
            .to_bytes();

        Ok(Self::from_parts(parts.method, parts.uri, parts.headers, body))
    }

    pub fn from_parts(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The body as JSON, when declared and well-formed
    pub fn json(&self) -> Option<Value> {
        if !media_type(&self.headers).ends_with("json") {
            return None;
        }
        serde_json::from_slice(&self.body).ok()
    }

    /// Whether the client asked for a streamed completion (`"stream": true`)
    pub fn wants_stream(&self) -> bool {
        self.json()
            .and_then(|v| v.get("stream").and_then(Value::as_bool))
            .unwrap_or(false)
    }
}

/// The request that will actually be sent upstream
#[derive(Debug, Clone)]
pub struct OutboundDraft {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OutboundDraft {
    /// Start from a copy of the inbound request aimed at `target`
    pub fn new(inbound: &InboundRequest, target: Uri) -> Self {
        let mut headers = inbound.headers.clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(HOST);
        headers.remove(CONTENT_LENGTH);

        Self {
            method: inbound.method.clone(),
            uri: target,
            headers,
            body: inbound.body.clone(),
        }
    }

    /// Replace the body with a JSON document
    pub fn set_json_body(&mut self, value: &Value) -> Result<(), serde_json::Error> {
        self.body = Bytes::from(serde_json::to_vec(value)?);
        Ok(())
    }

    pub fn into_request(self) -> ProxyResult<Request<Body>> {
        let mut request = Request::builder()
            .method(self.method)
            .uri(self.uri)
            .body(Body::from(self.body))
            .map_err(|e| ProxyError::Internal(format!("failed to build upstream request: {e}")))?;
        *request.headers_mut() = self.headers;
        Ok(request)
    }
}

/// Ordered request rewriters for one route
pub struct RequestRewritePipeline {
    filters: Vec<NamedRewriter>,
    dump: Arc<dyn DumpLogger>,
    capture: CaptureConfig,
}

impl RequestRewritePipeline {
    pub fn new(filters: Vec<NamedRewriter>, dump: Arc<dyn DumpLogger>, capture: CaptureConfig) -> Self {
        Self {
            filters,
            dump,
            capture,
        }
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run every rewriter in order and return the draft to send
    ///
    /// On failure the error is also stored on the context and no draft is
    /// returned, so nothing can be sent upstream.
    pub async fn run(
        &self,
        ctx: &RequestContext,
        inbound: &InboundRequest,
        target: Uri,
    ) -> Result<OutboundDraft, Arc<PipelineError>> {
        self.note_skeleton(ctx, inbound, &target);
        self.dump.dump(
            ctx,
            Dump {
                label: "inbound",
                start_line: format!("{} {}", inbound.method, inbound.uri),
                headers: &inbound.headers,
                body: &inbound.body,
            },
        );

        let mut outbound = OutboundDraft::new(inbound, target);

        for (index, named) in self.filters.iter().enumerate() {
            let span = named.tag.span(Stage::Request, ctx);
            let applied = guarded(span, named.filter.rewrite(ctx, inbound, &mut outbound)).await;

            if let Err(cause) = applied {
                let err = Arc::new(PipelineError::new(
                    Stage::Request,
                    Some(named.tag.name().to_string()),
                    cause,
                ));
                ctx.record_error(Arc::clone(&err));
                warn!(
                    request_id = %ctx.request_id(),
                    filter = %named.tag,
                    error = %err,
                    "request filter failed"
                );
                return Err(err);
            }

            let separator = if index == 0 { "" } else { "," };
            ctx.audit()
                .note_append(keys::FILTERS_APPLIED, &format!("{separator}{}", named.tag.name()));
        }

        debug!(request_id = %ctx.request_id(), uri = %outbound.uri, "request rewritten");
        self.dump.dump(
            ctx,
            Dump {
                label: "outbound",
                start_line: format!("{} {}", outbound.method, outbound.uri),
                headers: &outbound.headers,
                body: &outbound.body,
            },
        );
        Ok(outbound)
    }

    fn note_skeleton(&self, ctx: &RequestContext, inbound: &InboundRequest, target: &Uri) {
        let audit = ctx.audit();
        audit.note(keys::REQUEST_METHOD, Value::from(inbound.method.as_str()));
        audit.note(keys::REQUEST_PATH, Value::from(inbound.uri.path()));
        audit.note(keys::REQUEST_UPSTREAM, Value::from(target.to_string()));
        audit.note(keys::REQUEST_BODY_BYTES, Value::from(inbound.body.len()));

        let media_type = media_type(&inbound.headers);
        let body = if media_type.starts_with(content_types::MULTIPART_FORM_DATA)
            || media_type == content_types::APPLICATION_OCTET_STREAM
        {
            format!("(binary body, {} bytes)", inbound.body.len())
        } else {
            truncate(&inbound.body, *self.capture.head.as_ref(), *self.capture.tail.as_ref())
        };
        audit.note(keys::REQUEST_BODY, Value::from(body));

        if ctx.model().is_none() {
            if let Some(model) = inbound
                .json()
                .and_then(|v| v.get("model").and_then(Value::as_str).map(str::to_string))
            {
                ctx.set_model(model);
            }
        }
        if let Some(session) = inbound
            .headers
            .get(X_SESSION_ID)
            .and_then(|v| v.to_str().ok())
        {
            ctx.set_session(session.to_string());
        }
    }
}
