//! Middleware stack builder for clean composition

use crate::proxy::middleware::*;
use axum::{middleware::from_fn, Router};
use tower_http::trace::TraceLayer;

/// Builder for composing the proxy middleware stack
#[derive(Clone, Debug)]
pub struct ProxyMiddlewareStack {
    enable_logging: bool,
}

impl ProxyMiddlewareStack {
    pub fn new() -> Self {
        Self {
            enable_logging: true,
        }
    }

    pub fn without_logging(mut self) -> Self {
        self.enable_logging = false;
        self
    }

    /// Apply the middleware stack to a router
    ///
    /// Outer to inner: HTTP trace span, request id, then logging, so every
    /// log line carries the id.
    pub fn apply_to_router<S>(self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let router = if self.enable_logging {
            router.layer(from_fn(logging_middleware))
        } else {
            router
        };
        router
            .layer(from_fn(request_id_middleware))
            .layer(TraceLayer::new_for_http())
    }
}

impl Default for ProxyMiddlewareStack {
    fn default() -> Self {
        Self::new()
    }
}
