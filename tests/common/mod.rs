//! Shared fixtures: an axum mock upstream, a gateway in front of it and a
//! collecting audit writer

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use flate2::{write::GzEncoder, Compression};
use http_body_util::BodyExt;
use llm_relay::proxy::audit::{AuditError, AuditRecord, AuditWriter};
use llm_relay::proxy::registry::{FilterRegistry, FilterSpec};
use llm_relay::proxy::types::{RoutePrefix, TargetUrl};
use llm_relay::proxy::{Gateway, GatewayConfig, RouteConfig};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

pub const ANTHROPIC_STREAM: &[&str] = &[
    "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-test\",\"usage\":{\"input_tokens\":12,\"output_tokens\":1}}}\n\n",
    "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"Hi\"}}\n\n",
    "event: message_delta\ndata: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":34}}\n\n",
    "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
];

fn sse(pieces: &'static [&'static str]) -> Response {
    let stream = futures_util::stream::iter(
        pieces
            .iter()
            .map(|piece| Ok::<_, std::io::Error>(Bytes::from_static(piece.as_bytes()))),
    );
    Response::builder()
        .header("content-type", "text/event-stream")
        .body(Body::from_stream(stream))
        .unwrap()
}

async fn numbered_events() -> Response {
    sse(&["data: 1\n\n", "data: 2\n\n"])
}

async fn anthropic_events() -> Response {
    sse(ANTHROPIC_STREAM)
}

/// Reflects the headers and body the upstream actually received
async fn echo(headers: HeaderMap, body: Bytes) -> Json<Value> {
    let seen: serde_json::Map<String, Value> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                Value::from(value.to_str().unwrap_or_default()),
            )
        })
        .collect();
    Json(json!({ "headers": seen, "body": String::from_utf8_lossy(&body) }))
}

async fn missing_model() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": { "type": "not_found_error", "message": "model: nope" } })),
    )
}

async fn gzipped() -> Response {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(br#"{"usage":{"input_tokens":3,"output_tokens":4}}"#)
        .unwrap();
    Response::builder()
        .header("content-type", "application/json")
        .header("content-encoding", "gzip")
        .body(Body::from(encoder.finish().unwrap()))
        .unwrap()
}

async fn start_server(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind listener");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("Server failed");
    });
    addr
}

/// Mock LLM backend on an ephemeral port
pub async fn start_upstream() -> SocketAddr {
    let router = Router::new()
        .route("/v1/stream", post(numbered_events))
        .route("/v1/messages", post(anthropic_events))
        .route("/v1/echo", post(echo))
        .route("/v1/missing", post(missing_model))
        .route("/v1/gzip", get(gzipped));
    start_server(router).await
}

#[derive(Default)]
pub struct CollectingWriter {
    records: Mutex<Vec<AuditRecord>>,
}

#[async_trait]
impl AuditWriter for CollectingWriter {
    async fn write(&self, record: AuditRecord) -> Result<(), AuditError> {
        self.records.lock().push(record);
        Ok(())
    }
}

impl CollectingWriter {
    /// Wait for the pump task to flush; records land after the client saw EOF
    pub async fn wait_for(&self, count: usize) -> Vec<AuditRecord> {
        for _ in 0..200 {
            {
                let records = self.records.lock();
                if records.len() >= count {
                    return records.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} audit records");
    }
}

pub fn route(name: &str, prefix: &str, upstream: SocketAddr, filters: Vec<FilterSpec>) -> RouteConfig {
    RouteConfig {
        name: name.to_string(),
        prefix: RoutePrefix::try_new(prefix.to_string()).unwrap(),
        upstream: TargetUrl::try_new(format!("http://{upstream}")).unwrap(),
        streaming: false,
        filters,
    }
}

pub fn spec(name: &str, kind: &str, settings: Value) -> FilterSpec {
    FilterSpec {
        name: name.to_string(),
        kind: kind.to_string(),
        settings,
    }
}

pub struct TestGateway {
    pub addr: SocketAddr,
    pub audit: Arc<CollectingWriter>,
}

/// Serve a gateway with the given routes on an ephemeral port
pub async fn start_gateway(routes: Vec<RouteConfig>, registry: FilterRegistry) -> TestGateway {
    let config = GatewayConfig {
        request_timeout: Duration::from_secs(5),
        ..GatewayConfig::default()
    };
    start_gateway_with(config, routes, registry).await
}

pub async fn start_gateway_with(
    config: GatewayConfig,
    routes: Vec<RouteConfig>,
    registry: FilterRegistry,
) -> TestGateway {
    let audit = Arc::new(CollectingWriter::default());
    let gateway = Gateway::builder(config)
        .routes(routes)
        .registry(registry)
        .audit_writer(audit.clone())
        .build()
        .expect("gateway builds");
    let addr = start_server(gateway.into_router()).await;
    TestGateway { addr, audit }
}

pub async fn request(
    gateway: &TestGateway,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: impl Into<Body>,
) -> http::Response<hyper::body::Incoming> {
    let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
        .build_http();

    let mut builder = http::Request::builder()
        .method(method)
        .uri(format!("http://{}{path}", gateway.addr));
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = builder.body(body.into()).unwrap();
    client.request(request).await.unwrap()
}

pub async fn send(
    gateway: &TestGateway,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: impl Into<Body>,
) -> (StatusCode, HeaderMap, Bytes) {
    let response = request(gateway, method, path, headers, body).await;
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, body)
}
