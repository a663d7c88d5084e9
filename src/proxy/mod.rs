//! Reverse proxy for LLM backends
//!
//! A request is matched to a route, rewritten by the route's request
//! filters and forwarded. The upstream response body is split into chunks
//! by a framing-aware splitter and pumped through the route's response
//! filters to the client. Every request ends in exactly one audit record,
//! drained off a ring buffer by the audit path.

pub mod audit;
pub mod audit_path;
pub mod capture;
pub mod context;
pub mod dump;
pub mod error_boundary;
pub mod error_response;
pub mod filter;
pub mod filters;
pub mod headers;
pub mod middleware;
pub mod middleware_stack;
pub mod registry;
pub mod request_pipeline;
pub mod response_pipeline;
pub mod ring_buffer;
pub mod service;
pub mod splitter;
pub mod transport;
pub mod types;
pub mod url_resolver;

pub use context::RequestContext;
pub use registry::{FilterRegistry, FilterSpec};
pub use service::{Gateway, GatewayBuilder, RouteConfig};
pub use types::{GatewayConfig, ProxyError, ProxyResult};
