//! Gateway service: route matching and the per-request flow
//!
//! A request walks the same path on every route:
//!
//! 1. match the longest route prefix and create the [`RequestContext`]
//! 2. capture the inbound body under the size limit
//! 3. run the request rewrite pipeline on the pristine snapshot
//! 4. round-trip the draft through the [`Transport`]
//! 5. hand the upstream response to the response modify pipeline
//!
//! Every failure on that path is turned into a client response by the
//! [`ErrorBoundary`], which also flushes the audit record exactly once.
//! Successful responses flush from the pump task when the body ends.
//!
//! ```rust,ignore
//! let gateway = Gateway::builder(GatewayConfig::default())
//!     .routes(settings.routes)
//!     .build()?;
//! let router = gateway.into_router();
//! axum::serve(listener, router).await?;
//! ```

use crate::log_messages::request_processing;
use crate::proxy::audit::{AuditWriter, RingBufferAuditWriter};
use crate::proxy::audit_path::AuditPathProcessor;
use crate::proxy::context::RequestContext;
use crate::proxy::dump::{DumpLogger, TracingDumpLogger};
use crate::proxy::error_boundary::ErrorBoundary;
use crate::proxy::headers::{paths, X_REQUEST_ID};
use crate::proxy::middleware_stack::ProxyMiddlewareStack;
use crate::proxy::registry::{FilterRegistry, FilterSpec, RegistryError};
use crate::proxy::request_pipeline::{InboundRequest, RequestRewritePipeline};
use crate::proxy::response_pipeline::{ResponseModifyPipeline, StreamHandle};
use crate::proxy::ring_buffer::RingBuffer;
use crate::proxy::splitter::{DecoderFactory, SplitterSelector};
use crate::proxy::transport::{HyperTransport, Transport};
use crate::proxy::types::*;
use crate::proxy::url_resolver::UrlResolver;
use axum::{
    body::Body,
    extract::{Request, State},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Route name used in the audit record when no route matched
pub const UNROUTED: &str = "(none)";

/// One configured route
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    pub name: String,
    pub prefix: RoutePrefix,
    pub upstream: TargetUrl,
    /// Treat every request on this route as streaming, regardless of its body
    #[serde(default)]
    pub streaming: bool,
    /// Filters in execution order
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
}

/// A route with its pipelines built
struct Route {
    name: String,
    prefix: RoutePrefix,
    upstream: TargetUrl,
    streaming: bool,
    request: RequestRewritePipeline,
    response: ResponseModifyPipeline,
}

pub struct GatewayBuilder {
    config: GatewayConfig,
    routes: Vec<RouteConfig>,
    registry: FilterRegistry,
    transport: Option<Arc<dyn Transport>>,
    audit_writer: Option<Arc<dyn AuditWriter>>,
    dump: Arc<dyn DumpLogger>,
    decoder_factory: Option<DecoderFactory>,
}

impl GatewayBuilder {
    pub fn routes(mut self, routes: impl IntoIterator<Item = RouteConfig>) -> Self {
        self.routes.extend(routes);
        self
    }

    pub fn route(mut self, route: RouteConfig) -> Self {
        self.routes.push(route);
        self
    }

    pub fn registry(mut self, registry: FilterRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Send audit records somewhere other than the ring buffer
    pub fn audit_writer(mut self, writer: Arc<dyn AuditWriter>) -> Self {
        self.audit_writer = Some(writer);
        self
    }

    pub fn dump_logger(mut self, dump: Arc<dyn DumpLogger>) -> Self {
        self.dump = dump;
        self
    }

    pub fn decoder_factory(mut self, factory: DecoderFactory) -> Self {
        self.decoder_factory = Some(factory);
        self
    }

    pub fn build(self) -> Result<Gateway, RegistryError> {
        let ring_buffer = Arc::new(RingBuffer::new(&self.config.ring_buffer));
        let audit_writer = self
            .audit_writer
            .unwrap_or_else(|| -> Arc<dyn AuditWriter> {
                Arc::new(RingBufferAuditWriter::new(ring_buffer.clone()))
            });
        let boundary = Arc::new(ErrorBoundary::new(audit_writer));
        let transport = self
            .transport
            .unwrap_or_else(|| -> Arc<dyn Transport> {
                Arc::new(HyperTransport::new(self.config.request_timeout))
            });

        let mut selector =
            SplitterSelector::new(self.config.chunk_size, self.config.max_event_frame);
        if let Some(factory) = self.decoder_factory {
            selector = selector.with_decoder_factory(factory);
        }

        let mut routes = Vec::with_capacity(self.routes.len());
        for route in self.routes {
            let chains = self.registry.build_chains(&route.filters)?;
            debug!(
                route = %route.name,
                prefix = %route.prefix,
                request_filters = chains.request.len(),
                response_filters = chains.response.len(),
                "Route built"
            );
            routes.push(Route {
                request: RequestRewritePipeline::new(
                    chains.request,
                    self.dump.clone(),
                    self.config.capture,
                ),
                response: ResponseModifyPipeline::new(
                    chains.response,
                    selector.clone(),
                    boundary.clone(),
                    self.dump.clone(),
                )
                .with_limits(
                    self.config.pipe_capacity,
                    self.config.capture,
                    self.config.max_response_size,
                ),
                name: route.name,
                prefix: route.prefix,
                upstream: route.upstream,
                streaming: route.streaming,
            });
        }
        // Longest prefix first so the first match wins
        routes.sort_by_key(|route| std::cmp::Reverse(route.prefix.as_ref().len()));

        Ok(Gateway {
            config: self.config,
            routes,
            transport,
            boundary,
            ring_buffer,
            audit_shutdown_tx: None,
        })
    }
}

/// The gateway: routes, transport, error boundary and the audit path
pub struct Gateway {
    config: GatewayConfig,
    routes: Vec<Route>,
    transport: Arc<dyn Transport>,
    boundary: Arc<ErrorBoundary>,
    ring_buffer: Arc<RingBuffer>,
    audit_shutdown_tx: Option<mpsc::Sender<()>>,
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder {
            config,
            routes: Vec::new(),
            registry: FilterRegistry::builtin(),
            transport: None,
            audit_writer: None,
            dump: Arc::new(TracingDumpLogger::default()),
            decoder_factory: None,
        }
    }

    pub fn ring_buffer(&self) -> Arc<RingBuffer> {
        self.ring_buffer.clone()
    }

    pub fn route_names(&self) -> Vec<&str> {
        self.routes.iter().map(|route| route.name.as_str()).collect()
    }

    /// Start draining audit records off the ring buffer
    pub fn start_audit_processor(&mut self) {
        if self.audit_shutdown_tx.is_some() {
            return;
        }
        let (processor, shutdown_tx) = AuditPathProcessor::new(self.ring_buffer.clone());
        tokio::spawn(processor.run());
        self.audit_shutdown_tx = Some(shutdown_tx);
    }

    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.audit_shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
    }

    /// Build the axum router and start the audit processor
    pub fn into_router(mut self) -> Router {
        self.start_audit_processor();
        let router = Router::new()
            .route(paths::HEALTH, get(health_handler))
            .fallback(proxy_handler)
            .with_state(Arc::new(self));
        ProxyMiddlewareStack::new().apply_to_router(router)
    }

    fn route_for(&self, path: &str) -> Option<&Route> {
        self.routes
            .iter()
            .find(|route| UrlResolver::matches(&route.prefix, path))
    }

    /// Proxy one request
    ///
    /// The handle is present when a body pump was started. Awaiting it waits
    /// for the stream to end and the audit record to be flushed; dropping it
    /// leaves the pump running.
    pub async fn handle(&self, request: Request<Body>) -> (Response, Option<StreamHandle>) {
        let request_id = request
            .extensions()
            .get::<RequestId>()
            .copied()
            .or_else(|| {
                request
                    .headers()
                    .get(X_REQUEST_ID)
                    .and_then(|v| v.to_str().ok())
                    .and_then(RequestId::parse)
            })
            .unwrap_or_else(RequestId::generate);

        let path = request.uri().path().to_string();
        let Some(route) = self.route_for(&path) else {
            let ctx = RequestContext::new(request_id, UNROUTED);
            let response = self.boundary.respond(&ctx, ProxyError::NoRoute(path)).await;
            return (response, None);
        };

        let ctx = Arc::new(RequestContext::new(request_id, route.name.clone()));
        match self.forward(route, &ctx, request).await {
            Ok((response, handle)) => (response, Some(handle)),
            Err(error) => (self.boundary.respond(&ctx, error).await, None),
        }
    }

    async fn forward(
        &self,
        route: &Route,
        ctx: &Arc<RequestContext>,
        request: Request<Body>,
    ) -> ProxyResult<(Response, StreamHandle)> {
        let target = UrlResolver::resolve_target_uri(&route.upstream, &route.prefix, request.uri())?;
        let inbound = InboundRequest::capture(request, self.config.max_request_size).await?;

        ctx.set_streaming(route.streaming || inbound.wants_stream());
        route.response.selector().preselect(ctx);

        let outbound = route.request.run(ctx, &inbound, target).await?;
        let upstream = self.transport.round_trip(outbound.into_request()?).await?;

        let (mut response, handle) = route.response.modify(ctx.clone(), upstream).await?;
        ErrorBoundary::stamp(response.headers_mut(), ctx);
        info!(
            request_id = %ctx.request_id(),
            route = %route.name,
            status = response.status().as_u16(),
            streaming = ctx.is_streaming(),
            "{}",
            request_processing::UPSTREAM_RESPONDED
        );
        Ok((response, handle))
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        if let Some(tx) = self.audit_shutdown_tx.take() {
            let _ = tx.try_send(());
        }
    }
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

async fn proxy_handler(State(gateway): State<Arc<Gateway>>, request: Request) -> Response {
    let (response, _stream) = gateway.handle(request).await;
    response
}
