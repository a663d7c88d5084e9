//! Filter capabilities and the per-hook execution guard
//!
//! A filter is a named, ordered unit of behavior with up to two
//! capabilities: [`RequestRewriter`] mutates the outbound draft, and
//! [`ResponseModifier`] sees the response headers, every body chunk and the
//! end of the stream.
//!
//! Request rewriters are shared across concurrent requests and take `&self`.
//! Response modifiers are built fresh for every response stream by a
//! [`ModifierFactory`], so their fields can safely hold per-stream state.

use crate::proxy::context::RequestContext;
use crate::proxy::error_boundary::{HttpError, PipelineCause, Stage};
use crate::proxy::request_pipeline::{InboundRequest, OutboundDraft};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::FutureExt;
use http::{HeaderMap, StatusCode};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tracing::{Instrument, Span};

/// Package component of every filter tag
pub const FILTER_PACKAGE: &str = "llm_relay";

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("{0}")]
    Message(String),

    #[error("invalid filter settings: {0}")]
    Settings(String),

    #[error(transparent)]
    Http(HttpError),

    #[error("invalid header: {0}")]
    Header(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl FilterError {
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

/// Identity of a configured filter instance, rendered as `package/kind@instance`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterTag {
    kind: String,
    instance: String,
}

impl FilterTag {
    pub fn new(kind: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            instance: instance.into(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The configured instance name, used when attributing failures
    pub fn name(&self) -> &str {
        &self.instance
    }

    /// Span every hook invocation of this filter runs in
    pub fn span(&self, stage: Stage, request: &RequestContext) -> Span {
        tracing::debug_span!(
            "filter",
            filter = %self,
            stage = %stage,
            request_id = %request.request_id()
        )
    }
}

impl fmt::Display for FilterTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{FILTER_PACKAGE}/{}@{}", self.kind, self.instance)
    }
}

/// Response status and headers as filters see and edit them
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Mutates the outbound request
#[async_trait]
pub trait RequestRewriter: Send + Sync {
    /// `inbound` is the pristine client request; only `outbound` is sent
    async fn rewrite(
        &self,
        ctx: &RequestContext,
        inbound: &InboundRequest,
        outbound: &mut OutboundDraft,
    ) -> Result<(), FilterError>;
}

/// Reshapes one response stream
#[async_trait]
pub trait ResponseModifier: Send {
    async fn on_headers(
        &mut self,
        _ctx: &RequestContext,
        _head: &mut ResponseHead,
    ) -> Result<(), FilterError> {
        Ok(())
    }

    /// Transform one chunk; an empty result swallows it
    async fn on_body_chunk(
        &mut self,
        _ctx: &RequestContext,
        chunk: Bytes,
    ) -> Result<Bytes, FilterError> {
        Ok(chunk)
    }

    /// Called once at the end of the stream, success or not; returned bytes
    /// are written after the last chunk
    async fn on_complete(
        &mut self,
        _ctx: &RequestContext,
        _head: &ResponseHead,
    ) -> Result<Option<Bytes>, FilterError> {
        Ok(None)
    }
}

/// Builds a fresh modifier for each response stream
pub type ModifierFactory = Arc<dyn Fn() -> Box<dyn ResponseModifier> + Send + Sync>;

#[derive(Clone)]
pub struct NamedRewriter {
    pub tag: FilterTag,
    pub filter: Arc<dyn RequestRewriter>,
}

#[derive(Clone)]
pub struct NamedModifierFactory {
    pub tag: FilterTag,
    pub factory: ModifierFactory,
}

impl NamedModifierFactory {
    pub fn create(&self) -> NamedModifier {
        NamedModifier {
            tag: self.tag.clone(),
            filter: (self.factory)(),
        }
    }
}

pub struct NamedModifier {
    pub tag: FilterTag,
    pub filter: Box<dyn ResponseModifier>,
}

/// Run one hook inside its filter span, converting a panic into a cause
pub(crate) async fn guarded<T, F>(span: Span, hook: F) -> Result<T, PipelineCause>
where
    F: Future<Output = Result<T, FilterError>>,
{
    match AssertUnwindSafe(hook.instrument(span)).catch_unwind().await {
        Ok(result) => result.map_err(PipelineCause::Filter),
        Err(payload) => Err(PipelineCause::from_panic(payload)),
    }
}
