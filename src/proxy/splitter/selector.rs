//! Per-request splitter selection

use crate::proxy::context::RequestContext;
use crate::proxy::headers::content_types;
use crate::proxy::splitter::decompress::{default_decoder_factory, needs_decoding};
use crate::proxy::splitter::event_stream::EVENT_STREAM_CONTENT_TYPE;
use crate::proxy::splitter::{
    ChunkSplitter, DecoderFactory, DecompressingSplitter, EventStreamSplitter, FixedSizeSplitter,
    SseSplitter, WholeStreamSplitter,
};
use crate::proxy::types::{ChunkSize, MaxFrameSize};
use http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use http::HeaderMap;
use std::sync::Arc;

/// Chooses the framing for a response stream and wires decompression
#[derive(Clone)]
pub struct SplitterSelector {
    chunk_size: ChunkSize,
    max_frame: MaxFrameSize,
    factory: DecoderFactory,
}

impl SplitterSelector {
    pub fn new(chunk_size: ChunkSize, max_frame: MaxFrameSize) -> Self {
        Self {
            chunk_size,
            max_frame,
            factory: default_decoder_factory(),
        }
    }

    /// Replace the decoder factory
    pub fn with_decoder_factory(mut self, factory: DecoderFactory) -> Self {
        self.factory = factory;
        self
    }

    /// Install the default framing before the upstream call is made
    pub fn preselect(&self, ctx: &RequestContext) {
        let splitter: Box<dyn ChunkSplitter> = if ctx.is_streaming() {
            Box::new(SseSplitter::default())
        } else {
            Box::new(WholeStreamSplitter::default())
        };
        ctx.store_splitter(splitter);
    }

    /// Pick the splitter for a response, stripping `Content-Encoding` from
    /// the headers the client will see
    pub fn select(&self, ctx: &Arc<RequestContext>, headers: &mut HeaderMap) -> Box<dyn ChunkSplitter> {
        let content_type = header_str(headers, CONTENT_TYPE);

        let splitter = match ctx.take_splitter() {
            Some(existing) if existing.is_compatible(&content_type) => existing,
            _ => self.for_content_type(&content_type),
        };
        ctx.set_splitter_kind(splitter.kind());

        self.decompressing(ctx, headers, splitter)
    }

    /// Whole-body framing regardless of content type, used for error bodies
    ///
    /// `limit` caps the decoded body, not the bytes on the wire.
    pub fn whole_body(
        &self,
        ctx: &Arc<RequestContext>,
        headers: &mut HeaderMap,
        limit: usize,
    ) -> Box<dyn ChunkSplitter> {
        self.decompressing(ctx, headers, Box::new(WholeStreamSplitter::bounded(limit)))
    }

    fn decompressing(
        &self,
        ctx: &Arc<RequestContext>,
        headers: &mut HeaderMap,
        splitter: Box<dyn ChunkSplitter>,
    ) -> Box<dyn ChunkSplitter> {
        let encoding = header_str(headers, CONTENT_ENCODING);
        let header_encoding = if needs_decoding(&encoding) {
            ctx.set_response_encoding(encoding.clone());
            headers.remove(CONTENT_ENCODING);
            Some(encoding)
        } else {
            None
        };

        Box::new(DecompressingSplitter::new(
            splitter,
            Arc::clone(ctx),
            header_encoding,
            Arc::clone(&self.factory),
        ))
    }

    fn for_content_type(&self, content_type: &str) -> Box<dyn ChunkSplitter> {
        if content_type.starts_with(EVENT_STREAM_CONTENT_TYPE) {
            Box::new(EventStreamSplitter::new(self.max_frame))
        } else if content_type.starts_with(content_types::APPLICATION_JSON) {
            Box::new(WholeStreamSplitter::default())
        } else if content_type.starts_with(content_types::TEXT_EVENT_STREAM) {
            Box::new(SseSplitter::default())
        } else {
            Box::new(FixedSizeSplitter::new(self.chunk_size))
        }
    }
}

fn header_str(headers: &HeaderMap, name: http::header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_ascii_lowercase())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::splitter::SplitterKind;
    use crate::proxy::types::{GatewayConfig, RequestId};
    use http::HeaderValue;
    use rstest::rstest;

    fn selector() -> SplitterSelector {
        let config = GatewayConfig::default();
        SplitterSelector::new(config.chunk_size, config.max_event_frame)
    }

    fn context() -> Arc<RequestContext> {
        Arc::new(RequestContext::new(RequestId::generate(), "test"))
    }

    fn headers(content_type: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
        headers
    }

    #[rstest]
    #[case("application/vnd.amazon.eventstream", SplitterKind::EventStream)]
    #[case("application/json; charset=utf-8", SplitterKind::WholeStream)]
    #[case("text/event-stream", SplitterKind::ServerSentEvents)]
    #[case("text/plain", SplitterKind::FixedSize)]
    #[case("", SplitterKind::FixedSize)]
    fn test_selection_by_content_type(#[case] content_type: &str, #[case] expected: SplitterKind) {
        let ctx = context();
        let mut headers = headers(content_type);

        let splitter = selector().select(&ctx, &mut headers);

        assert_eq!(splitter.kind(), expected);
        assert_eq!(ctx.splitter_kind(), Some(expected));
    }

    #[test]
    fn test_compatible_preselection_is_reused() {
        let ctx = context();
        ctx.set_streaming(true);
        selector().preselect(&ctx);

        // A generic splitter is compatible with anything, even a JSON body
        let splitter = selector().select(&ctx, &mut headers("application/json"));

        assert_eq!(splitter.kind(), SplitterKind::ServerSentEvents);
    }

    #[test]
    fn test_incompatible_cached_splitter_is_replaced() {
        let ctx = context();
        ctx.store_splitter(Box::new(EventStreamSplitter::default()));

        let splitter = selector().select(&ctx, &mut headers("text/event-stream"));

        assert_eq!(splitter.kind(), SplitterKind::ServerSentEvents);
    }

    #[test]
    fn test_content_encoding_recorded_and_stripped() {
        let ctx = context();
        let mut headers = headers("text/event-stream");
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));

        selector().select(&ctx, &mut headers);

        assert_eq!(ctx.response_encoding().as_deref(), Some("gzip"));
        assert!(!headers.contains_key(CONTENT_ENCODING));
    }

    #[test]
    fn test_identity_encoding_left_alone() {
        let ctx = context();
        let mut headers = headers("application/json");
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("identity"));

        selector().select(&ctx, &mut headers);

        assert_eq!(ctx.response_encoding(), None);
        assert!(headers.contains_key(CONTENT_ENCODING));
    }
}
