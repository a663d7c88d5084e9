//! Error paths through the full gateway

mod common;

use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use common::*;
use http_body_util::BodyExt;
use llm_relay::proxy::audit::keys;
use llm_relay::proxy::context::RequestContext;
use llm_relay::proxy::error_boundary::{HttpError, RAW_BACKEND_RESPONSE};
use llm_relay::proxy::filter::{FilterError, ModifierFactory, RequestRewriter, ResponseModifier};
use llm_relay::proxy::registry::{FilterHandle, FilterRegistry, FilterSpec};
use llm_relay::proxy::request_pipeline::{InboundRequest, OutboundDraft};
use llm_relay::proxy::types::RequestSizeLimit;
use llm_relay::proxy::GatewayConfig;
use serde_json::{json, Value};
use std::sync::Arc;

/// Marks every chunk it sees so a leak past the short-circuit is visible
struct Mark;

#[async_trait]
impl ResponseModifier for Mark {
    async fn on_body_chunk(
        &mut self,
        _ctx: &RequestContext,
        chunk: Bytes,
    ) -> Result<Bytes, FilterError> {
        let mut out = chunk.to_vec();
        out.extend_from_slice(b"<marked>");
        Ok(Bytes::from(out))
    }
}

/// Fails on the second SSE event
struct RejectSecond;

#[async_trait]
impl ResponseModifier for RejectSecond {
    async fn on_body_chunk(
        &mut self,
        _ctx: &RequestContext,
        chunk: Bytes,
    ) -> Result<Bytes, FilterError> {
        if chunk.as_ref() == b"data: 2\n\n" {
            return Err(FilterError::message("second event refused"));
        }
        Ok(chunk)
    }
}

/// Refuses every request with 429
struct RateLimited;

#[async_trait]
impl RequestRewriter for RateLimited {
    async fn rewrite(
        &self,
        _ctx: &RequestContext,
        _inbound: &InboundRequest,
        _outbound: &mut OutboundDraft,
    ) -> Result<(), FilterError> {
        Err(FilterError::Http(HttpError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "slow down",
        )))
    }
}

fn registry() -> FilterRegistry {
    fn mark(_: &FilterSpec) -> Result<FilterHandle, FilterError> {
        let factory: ModifierFactory = Arc::new(|| -> Box<dyn ResponseModifier> { Box::new(Mark) });
        Ok(FilterHandle::Response(factory))
    }
    fn reject_second(_: &FilterSpec) -> Result<FilterHandle, FilterError> {
        let factory: ModifierFactory =
            Arc::new(|| -> Box<dyn ResponseModifier> { Box::new(RejectSecond) });
        Ok(FilterHandle::Response(factory))
    }
    fn rate_limited(_: &FilterSpec) -> Result<FilterHandle, FilterError> {
        Ok(FilterHandle::Request(Arc::new(RateLimited)))
    }

    let mut registry = FilterRegistry::builtin();
    registry
        .register("mark", mark)
        .register("reject_second", reject_second)
        .register("rate_limited", rate_limited);
    registry
}

#[tokio::test]
async fn test_upstream_error_short_circuits_response_filters() {
    let upstream = start_upstream().await;
    let filters = vec![spec("mark", "mark", Value::Null)];
    let gateway = start_gateway(vec![route("llm", "/llm", upstream, filters)], registry()).await;

    let (status, _, body) = send(&gateway, "POST", "/llm/v1/missing", &[], "{}").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    let envelope: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(envelope["code"], "UPSTREAM_ERROR");
    assert_eq!(
        envelope["details"][RAW_BACKEND_RESPONSE],
        json!({ "error": { "type": "not_found_error", "message": "model: nope" } })
    );
    assert!(!String::from_utf8_lossy(&body).contains("<marked>"));

    let records = gateway.audit.wait_for(1).await;
    assert_eq!(records[0].notes[keys::RESPONSE_STATUS], json!(404));
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let upstream = start_upstream().await;
    let gateway = start_gateway(vec![route("llm", "/llm", upstream, Vec::new())], registry()).await;

    let (status, headers, body) = send(&gateway, "POST", "/other/v1/echo", &[], "{}").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    let envelope: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(envelope["code"], "NO_ROUTE");
    assert_eq!(
        envelope["request_id"],
        headers["x-request-id"].to_str().unwrap()
    );
    assert_eq!(gateway.audit.wait_for(1).await.len(), 1);
}

#[tokio::test]
async fn test_request_filter_error_never_reaches_upstream() {
    let upstream = start_upstream().await;
    let filters = vec![
        spec("limit", "rate_limited", Value::Null),
        spec("add", "headers", json!({ "set": { "x-after": "1" } })),
    ];
    let gateway = start_gateway(vec![route("llm", "/llm", upstream, filters)], registry()).await;

    let (status, _, body) = send(&gateway, "POST", "/llm/v1/echo", &[], "{}").await;

    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    let envelope: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(envelope["code"], "FILTER_REJECTED");
    assert_eq!(envelope["message"], "slow down");
    // An echo from the upstream would carry a `headers` object
    assert!(envelope.get("headers").is_none());

    let records = gateway.audit.wait_for(1).await;
    assert_eq!(records[0].notes[keys::ERROR_STAGE], "request");
    assert_eq!(records[0].notes[keys::ERROR_FILTER], "limit");
}

#[tokio::test]
async fn test_mid_stream_filter_error_stops_the_stream() {
    let upstream = start_upstream().await;
    let filters = vec![spec("picky", "reject_second", Value::Null)];
    let gateway = start_gateway(vec![route("llm", "/llm", upstream, filters)], registry()).await;

    let response = request(
        &gateway,
        "POST",
        "/llm/v1/stream",
        &[("content-type", "application/json")],
        r#"{"stream":true}"#,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body();
    let mut seen = Vec::new();
    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                if let Some(data) = frame.data_ref() {
                    seen.extend_from_slice(data);
                }
            }
            Err(_) => break,
        }
    }
    assert!(!String::from_utf8_lossy(&seen).contains("data: 2"));

    let records = gateway.audit.wait_for(1).await;
    let notes = &records[0].notes;
    assert_eq!(notes[keys::RESPONSE_OUTCOME], "failed");
    assert_eq!(notes[keys::ERROR_STAGE], "response");
    assert_eq!(notes[keys::ERROR_FILTER], "picky");
}

#[tokio::test]
async fn test_unreachable_upstream_is_bad_gateway() {
    let closed = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let gateway = start_gateway(vec![route("llm", "/llm", closed, Vec::new())], registry()).await;

    let (status, _, body) = send(&gateway, "POST", "/llm/v1/echo", &[], "{}").await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let envelope: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(envelope["code"], "UPSTREAM_UNAVAILABLE");
}

#[tokio::test]
async fn test_oversized_request_is_rejected() {
    let upstream = start_upstream().await;
    let config = GatewayConfig {
        max_request_size: RequestSizeLimit::try_new(8).unwrap(),
        ..GatewayConfig::default()
    };
    let gateway = start_gateway_with(
        config,
        vec![route("llm", "/llm", upstream, Vec::new())],
        registry(),
    )
    .await;

    let (status, _, body) = send(
        &gateway,
        "POST",
        "/llm/v1/echo",
        &[],
        "this body is longer than eight bytes",
    )
    .await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    let envelope: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(envelope["code"], "REQUEST_TOO_LARGE");
}
