//! Upstream URI composition for routed requests

use crate::proxy::types::{ProxyError, ProxyResult, RoutePrefix, TargetUrl};
use hyper::Uri;

pub struct UrlResolver;

impl UrlResolver {
    /// Resolve the upstream URI for a request matched by `prefix`
    ///
    /// The route prefix is removed from the inbound path and the remainder,
    /// query included, is appended to the upstream base URL.
    pub fn resolve_target_uri(
        target_url: &TargetUrl,
        prefix: &RoutePrefix,
        original_uri: &Uri,
    ) -> ProxyResult<Uri> {
        let base = target_url.as_ref().trim_end_matches('/');
        let path = original_uri.path();
        let rest = path
            .strip_prefix(prefix.as_ref().trim_end_matches('/'))
            .unwrap_or(path);

        let mut resolved = String::with_capacity(base.len() + rest.len() + 1);
        resolved.push_str(base);
        if !rest.is_empty() && !rest.starts_with('/') {
            resolved.push('/');
        }
        resolved.push_str(rest);
        if let Some(query) = original_uri.query() {
            resolved.push('?');
            resolved.push_str(query);
        }

        resolved
            .parse()
            .map_err(|_| ProxyError::InvalidTargetUrl(resolved))
    }

    /// Whether `path` falls under `prefix` on a segment boundary
    pub fn matches(prefix: &RoutePrefix, path: &str) -> bool {
        let prefix = prefix.as_ref().trim_end_matches('/');
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.is_empty(),
            None => false,
        }
    }
}
