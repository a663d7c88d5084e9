//! Upstream round trip

use crate::proxy::headers::strip_hop_by_hop;
use async_trait::async_trait;
use axum::body::Body;
use hyper::{Request, Response};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("outbound request has no routable target: {0}")]
    Unroutable(String),

    #[error("upstream did not respond within {0:?}")]
    Timeout(Duration),

    #[error("upstream connection failed: {0}")]
    Connect(String),
}

/// Sends an outbound request and returns the upstream response head with a
/// still-unread body
#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, request: Request<Body>) -> Result<Response<Body>, TransportError>;
}

/// Plain-HTTP transport on the hyper-util pooled client
///
/// The timeout bounds the wait for response headers; streaming bodies are
/// not cut off.
#[derive(Clone)]
pub struct HyperTransport {
    client: Client<HttpConnector, Body>,
    timeout: Duration,
}

impl HyperTransport {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .http1_title_case_headers(true)
            .http1_preserve_header_case(true)
            .build_http();
        Self { client, timeout }
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn round_trip(&self, request: Request<Body>) -> Result<Response<Body>, TransportError> {
        ensure_routable(&request)?;

        let uri = request.uri().clone();
        debug!(%uri, method = %request.method(), "forwarding upstream");

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))?
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, Body::new(body)))
    }
}

/// Reject a request without scheme or host before any I/O happens
pub fn ensure_routable<B>(request: &Request<B>) -> Result<(), TransportError> {
    let uri = request.uri();
    if uri.scheme().is_none() || uri.host().is_none() {
        return Err(TransportError::Unroutable(uri.to_string()));
    }
    Ok(())
}
