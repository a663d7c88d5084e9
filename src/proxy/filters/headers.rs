//! Header set/remove rules for either side of the gateway
//!
//! Settings:
//!
//! ```json
//! { "set": { "x-api-key": "sk-..." }, "remove": ["cookie"] }
//! ```
//!
//! Removals are applied before additions.

use crate::proxy::context::RequestContext;
use crate::proxy::filter::{FilterError, ModifierFactory, RequestRewriter, ResponseHead, ResponseModifier};
use crate::proxy::registry::{FilterHandle, FilterSpec};
use crate::proxy::request_pipeline::{InboundRequest, OutboundDraft};
use async_trait::async_trait;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const REQUEST_KIND: &str = "headers";
pub const RESPONSE_KIND: &str = "response_headers";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct HeaderRules {
    #[serde(default)]
    set: BTreeMap<String, String>,
    #[serde(default)]
    remove: Vec<String>,
}

/// Validated header edits
#[derive(Debug, Clone, Default)]
pub struct HeaderEdits {
    set: Vec<(HeaderName, HeaderValue)>,
    remove: Vec<HeaderName>,
}

impl HeaderEdits {
    pub fn from_settings(settings: &Value) -> Result<Self, FilterError> {
        let rules: HeaderRules = if settings.is_null() {
            HeaderRules::default()
        } else {
            serde_json::from_value(settings.clone())
                .map_err(|e| FilterError::Settings(e.to_string()))?
        };

        let set = rules
            .set
            .into_iter()
            .map(|(name, value)| {
                let header = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|_| FilterError::Header(name.clone()))?;
                let value =
                    HeaderValue::from_str(&value).map_err(|_| FilterError::Header(name))?;
                Ok((header, value))
            })
            .collect::<Result<Vec<_>, FilterError>>()?;
        let remove = rules
            .remove
            .into_iter()
            .map(|name| HeaderName::from_bytes(name.as_bytes()).map_err(|_| FilterError::Header(name)))
            .collect::<Result<Vec<_>, FilterError>>()?;

        Ok(Self { set, remove })
    }

    pub fn apply(&self, headers: &mut HeaderMap) {
        for name in &self.remove {
            headers.remove(name);
        }
        for (name, value) in &self.set {
            headers.insert(name.clone(), value.clone());
        }
    }
}

/// Edits the outbound request headers
pub struct RequestHeadersFilter {
    edits: HeaderEdits,
}

#[async_trait]
impl RequestRewriter for RequestHeadersFilter {
    async fn rewrite(
        &self,
        _ctx: &RequestContext,
        _inbound: &InboundRequest,
        outbound: &mut OutboundDraft,
    ) -> Result<(), FilterError> {
        self.edits.apply(&mut outbound.headers);
        Ok(())
    }
}

/// Edits the client-visible response headers
pub struct ResponseHeadersFilter {
    edits: Arc<HeaderEdits>,
}

#[async_trait]
impl ResponseModifier for ResponseHeadersFilter {
    async fn on_headers(
        &mut self,
        _ctx: &RequestContext,
        head: &mut ResponseHead,
    ) -> Result<(), FilterError> {
        self.edits.apply(&mut head.headers);
        Ok(())
    }
}

pub fn build_request(spec: &FilterSpec) -> Result<FilterHandle, FilterError> {
    let edits = HeaderEdits::from_settings(&spec.settings)?;
    Ok(FilterHandle::Request(Arc::new(RequestHeadersFilter { edits })))
}

pub fn build_response(spec: &FilterSpec) -> Result<FilterHandle, FilterError> {
    let edits = Arc::new(HeaderEdits::from_settings(&spec.settings)?);
    let factory: ModifierFactory = Arc::new(move || -> Box<dyn ResponseModifier> {
        Box::new(ResponseHeadersFilter {
            edits: Arc::clone(&edits),
        })
    });
    Ok(FilterHandle::Response(factory))
}
