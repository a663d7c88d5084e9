//! Filter registry: configuration names to constructors
//!
//! Filters are built once per route when the gateway starts. The registry is
//! a plain map literal, so every built-in kind is checked at compile time.

use crate::proxy::filter::{
    FilterError, FilterTag, ModifierFactory, NamedModifierFactory, NamedRewriter, RequestRewriter,
};
use crate::proxy::filters::{headers, usage_audit};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// One configured filter instance
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FilterSpec {
    /// Instance name, used in logs and error attribution
    pub name: String,
    /// Registered kind
    pub kind: String,
    #[serde(default)]
    pub settings: Value,
}

/// The capabilities a constructed filter offers
pub enum FilterHandle {
    Request(Arc<dyn RequestRewriter>),
    Response(ModifierFactory),
    Both {
        request: Arc<dyn RequestRewriter>,
        response: ModifierFactory,
    },
}

pub type FilterConstructor = fn(&FilterSpec) -> Result<FilterHandle, FilterError>;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("unknown filter kind '{kind}' for filter '{name}'")]
    UnknownKind { name: String, kind: String },

    #[error("filter '{name}' could not be built: {source}")]
    Construct {
        name: String,
        #[source]
        source: FilterError,
    },

    #[error("duplicate filter name '{0}'")]
    DuplicateName(String),
}

/// Request and response chains of a route, in configured order
#[derive(Default, Clone)]
pub struct FilterChains {
    pub request: Vec<NamedRewriter>,
    pub response: Vec<NamedModifierFactory>,
}

pub struct FilterRegistry {
    constructors: HashMap<&'static str, FilterConstructor>,
}

impl FilterRegistry {
    pub fn builtin() -> Self {
        let constructors: HashMap<&'static str, FilterConstructor> = HashMap::from([
            (headers::REQUEST_KIND, headers::build_request as FilterConstructor),
            (headers::RESPONSE_KIND, headers::build_response as FilterConstructor),
            (usage_audit::KIND, usage_audit::build as FilterConstructor),
        ]);
        Self { constructors }
    }

    /// Add or replace a kind
    pub fn register(&mut self, kind: &'static str, constructor: FilterConstructor) -> &mut Self {
        self.constructors.insert(kind, constructor);
        self
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.constructors.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn build(&self, spec: &FilterSpec) -> Result<FilterHandle, RegistryError> {
        let constructor =
            self.constructors
                .get(spec.kind.as_str())
                .ok_or_else(|| RegistryError::UnknownKind {
                    name: spec.name.clone(),
                    kind: spec.kind.clone(),
                })?;
        constructor(spec).map_err(|source| RegistryError::Construct {
            name: spec.name.clone(),
            source,
        })
    }

    /// Build every filter of a route and split them by capability
    pub fn build_chains(&self, specs: &[FilterSpec]) -> Result<FilterChains, RegistryError> {
        let mut seen = HashSet::new();
        let mut chains = FilterChains::default();

        for spec in specs {
            if !seen.insert(spec.name.as_str()) {
                return Err(RegistryError::DuplicateName(spec.name.clone()));
            }
            let tag = FilterTag::new(spec.kind.clone(), spec.name.clone());
            let (request, response) = match self.build(spec)? {
                FilterHandle::Request(request) => (Some(request), None),
                FilterHandle::Response(response) => (None, Some(response)),
                FilterHandle::Both { request, response } => (Some(request), Some(response)),
            };
            if let Some(filter) = request {
                chains.request.push(NamedRewriter {
                    tag: tag.clone(),
                    filter,
                });
            }
            if let Some(factory) = response {
                chains.response.push(NamedModifierFactory { tag, factory });
            }
        }

        Ok(chains)
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::context::RequestContext;
    use crate::proxy::filter::ResponseModifier;
    use crate::proxy::request_pipeline::{InboundRequest, OutboundDraft};
    use async_trait::async_trait;
    use serde_json::json;

    struct Marker;

    #[async_trait]
    impl RequestRewriter for Marker {
        async fn rewrite(
            &self,
            _ctx: &RequestContext,
            _inbound: &InboundRequest,
            _outbound: &mut OutboundDraft,
        ) -> Result<(), FilterError> {
            Ok(())
        }
    }

    #[async_trait]
    impl ResponseModifier for Marker {}

    fn build_marker(_spec: &FilterSpec) -> Result<FilterHandle, FilterError> {
        Ok(FilterHandle::Both {
            request: Arc::new(Marker),
            response: Arc::new(|| -> Box<dyn ResponseModifier> { Box::new(Marker) }),
        })
    }

    fn spec(name: &str, kind: &str) -> FilterSpec {
        FilterSpec {
            name: name.to_string(),
            kind: kind.to_string(),
            settings: Value::Null,
        }
    }

    #[test]
    fn test_builtin_kinds() {
        assert_eq!(
            FilterRegistry::builtin().kinds(),
            vec!["headers", "response_headers", "usage_audit"]
        );
    }

    #[test]
    fn test_chains_split_by_capability_in_order() {
        let mut registry = FilterRegistry::builtin();
        registry.register("marker", build_marker);

        let chains = registry
            .build_chains(&[
                spec("auth", "headers"),
                spec("both", "marker"),
                spec("usage", "usage_audit"),
            ])
            .unwrap();

        let request: Vec<_> = chains.request.iter().map(|f| f.tag.name()).collect();
        let response: Vec<_> = chains.response.iter().map(|f| f.tag.name()).collect();
        assert_eq!(request, ["auth", "both"]);
        assert_eq!(response, ["both", "usage"]);
        assert_eq!(chains.response[0].tag.to_string(), "llm_relay/marker@both");
    }

    #[test]
    fn test_unknown_kind() {
        let err = FilterRegistry::builtin()
            .build_chains(&[spec("x", "model_lookup")])
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::UnknownKind { .. }));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = FilterRegistry::builtin()
            .build_chains(&[spec("x", "headers"), spec("x", "usage_audit")])
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::DuplicateName(name) if name == "x"));
    }

    #[test]
    fn test_bad_settings_attributed_to_filter() {
        let mut bad = spec("auth", "headers");
        bad.settings = json!({ "set": "not a map" });

        let err = FilterRegistry::builtin().build_chains(&[bad]).err().unwrap();

        assert!(err.to_string().starts_with("filter 'auth' could not be built"));
    }
}
