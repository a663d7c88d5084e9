//! HTTP header constants and utilities for the gateway

use ::http::{header, HeaderMap, HeaderName};

/// Header name for request ID used for tracing and correlation
pub const X_REQUEST_ID: &str = "x-request-id";

/// Header name for session ID used for grouping related requests
pub const X_SESSION_ID: &str = "x-session-id";

/// Gateway-identifying header set on every response, errors included
pub const X_GATEWAY: &str = "x-gateway";

/// Value of [`X_GATEWAY`]
pub const GATEWAY_NAME: &str = concat!("llm_relay/", env!("CARGO_PKG_VERSION"));

/// Standard header re-exports for convenience
pub use header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING};

/// Connection-scoped headers that must not be forwarded in either direction
pub const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::UPGRADE,
];

/// Well-known paths
pub mod paths {
    /// Health check endpoint path
    pub const HEALTH: &str = "/health";
}

/// Content types that drive splitter selection and dump formatting
pub mod content_types {
    pub const APPLICATION_JSON: &str = "application/json";
    pub const APPLICATION_OCTET_STREAM: &str = "application/octet-stream";
    pub const TEXT_EVENT_STREAM: &str = "text/event-stream";
    pub const AMAZON_EVENT_STREAM: &str = "application/vnd.amazon.eventstream";
    pub const MULTIPART_FORM_DATA: &str = "multipart/form-data";
    pub const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
}

/// Remove hop-by-hop headers, including any named by `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
    headers.remove(TRANSFER_ENCODING);
}

/// Content type without parameters, lowercased
pub fn media_type(headers: &HeaderMap) -> String {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::http::HeaderValue;

    #[test]
    fn test_header_constants() {
        assert!(X_REQUEST_ID.starts_with("x-"));
        assert!(X_SESSION_ID.starts_with("x-"));
        assert!(X_GATEWAY.starts_with("x-"));
        assert!(GATEWAY_NAME.starts_with("llm_relay/"));
        assert!(paths::HEALTH.starts_with('/'));
    }

    #[test]
    fn test_strip_hop_by_hop_honors_connection_list() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-private"));
        headers.insert("x-private", HeaderValue::from_static("1"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(CONTENT_TYPE));
    }

    #[test]
    fn test_media_type_drops_parameters() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("Text/Event-Stream; charset=utf-8"),
        );
        assert_eq!(media_type(&headers), "text/event-stream");
        assert_eq!(media_type(&HeaderMap::new()), "");
    }
}
