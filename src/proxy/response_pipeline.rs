//! Response modify pipeline
//!
//! ```text
//! HEADERS -> STREAMING(chunk)* -> COMPLETE
//!    \            \
//!     FAILED       FAILED
//! ```
//!
//! [`ResponseModifyPipeline::modify`] runs the headers phase inline and
//! returns as soon as the response body has been swapped for the read end of
//! a bounded pipe. One spawned pump task then reads chunks from upstream,
//! threads each through every filter in order and writes the result to the
//! pipe. Chunks reach the client in exactly the order they were read.
//!
//! The pump is the only writer of the pipe. Its [`StreamHandle`] resolves once
//! every `on_complete` hook has run, the pipe is closed and the audit record
//! has been handed to the [`StreamCompletion`].

use crate::proxy::audit::{keys, AuditSink};
use crate::proxy::capture::BoundedCapture;
use crate::proxy::context::RequestContext;
use crate::proxy::dump::{Dump, DumpLogger};
use crate::proxy::error_boundary::{HttpError, PipelineCause, PipelineError, Stage};
use crate::proxy::filter::{guarded, NamedModifier, NamedModifierFactory, ResponseHead};
use crate::proxy::headers::CONTENT_LENGTH;
use crate::proxy::splitter::{BodyReader, ChunkSplitter, SplitError, SplitOutcome, SplitterSelector};
use crate::proxy::types::{CaptureConfig, PipeCapacity, ResponseSizeLimit};
use async_trait::async_trait;
use axum::body::Body;
use bytes::Bytes;
use chrono::Utc;
use futures_util::{FutureExt, TryStreamExt};
use http::Response;
use serde_json::Value;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;
use tracing::{debug, Instrument};

type PipeItem = Result<Bytes, Arc<PipelineError>>;

/// How a response stream ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamOutcome {
    #[default]
    Completed,
    Failed,
    ClientGone,
}

impl fmt::Display for StreamOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::ClientGone => "client_gone",
        })
    }
}

/// Summary of one pumped stream
#[derive(Debug, Clone, Default)]
pub struct StreamReport {
    pub outcome: StreamOutcome,
    pub error: Option<Arc<PipelineError>>,
    pub chunks: usize,
    pub swallowed: usize,
    pub received_bytes: usize,
    pub handled_bytes: usize,
}

impl StreamReport {
    fn failed(error: PipelineError) -> Self {
        Self {
            outcome: StreamOutcome::Failed,
            error: Some(Arc::new(error)),
            ..Self::default()
        }
    }
}

/// Told exactly once when a pump finishes, however it finished
#[async_trait]
pub trait StreamCompletion: Send + Sync {
    async fn stream_finished(&self, ctx: &RequestContext, report: &StreamReport);
}

/// Supervised pump task
#[derive(Debug)]
pub struct StreamHandle(JoinHandle<StreamReport>);

impl StreamHandle {
    /// Wait for the pump, completion callback included
    pub async fn wait(self) -> StreamReport {
        match self.0.await {
            Ok(report) => report,
            Err(e) => StreamReport::failed(PipelineError::new(
                Stage::Response,
                None,
                PipelineCause::Panic(e.to_string()),
            )),
        }
    }
}

/// Ordered response modifiers for one route
pub struct ResponseModifyPipeline {
    filters: Vec<NamedModifierFactory>,
    selector: SplitterSelector,
    completion: Arc<dyn StreamCompletion>,
    dump: Arc<dyn DumpLogger>,
    pipe_capacity: PipeCapacity,
    capture: CaptureConfig,
    max_error_body: ResponseSizeLimit,
}

impl ResponseModifyPipeline {
    pub fn new(
        filters: Vec<NamedModifierFactory>,
        selector: SplitterSelector,
        completion: Arc<dyn StreamCompletion>,
        dump: Arc<dyn DumpLogger>,
    ) -> Self {
        let defaults = crate::proxy::types::GatewayConfig::default();
        Self {
            filters,
            selector,
            completion,
            dump,
            pipe_capacity: defaults.pipe_capacity,
            capture: defaults.capture,
            max_error_body: defaults.max_response_size,
        }
    }

    pub fn with_limits(
        mut self,
        pipe_capacity: PipeCapacity,
        capture: CaptureConfig,
        max_error_body: ResponseSizeLimit,
    ) -> Self {
        self.pipe_capacity = pipe_capacity;
        self.capture = capture;
        self.max_error_body = max_error_body;
        self
    }

    pub fn selector(&self) -> &SplitterSelector {
        &self.selector
    }

    /// Run the headers phase and start the pump
    ///
    /// An upstream status of 400 or above skips every filter and comes back
    /// as an error carrying the upstream body. A failing `on_headers` also
    /// returns an error and no chunk is ever read.
    pub async fn modify(
        &self,
        ctx: Arc<RequestContext>,
        response: Response<Body>,
    ) -> Result<(Response<Body>, StreamHandle), Arc<PipelineError>> {
        let (mut parts, body) = response.into_parts();
        ctx.audit()
            .note(keys::RESPONSE_STATUS, Value::from(parts.status.as_u16()));

        if parts.status.as_u16() >= 400 {
            let limit = *self.max_error_body.as_ref();
            let mut splitter = self.selector.whole_body(&ctx, &mut parts.headers, limit);
            let limited = Body::new(http_body_util::Limited::new(body, limit));
            let raw = read_whole(splitter.as_mut(), &mut body_reader(limited)).await;
            ctx.audit().note(
                keys::RESPONSE_RECEIVED,
                Value::from(crate::proxy::capture::truncate(
                    &raw,
                    *self.capture.head.as_ref(),
                    *self.capture.tail.as_ref(),
                )),
            );
            return Err(fail(
                &ctx,
                PipelineError::new(
                    Stage::Response,
                    None,
                    PipelineCause::Upstream(HttpError::upstream(parts.status, &raw)),
                ),
            ));
        }

        let splitter = self.selector.select(&ctx, &mut parts.headers);
        ctx.audit()
            .note(keys::RESPONSE_FRAMING, Value::from(splitter.kind().to_string()));

        let mut head = ResponseHead {
            status: parts.status,
            headers: std::mem::take(&mut parts.headers),
        };
        let mut modifiers: Vec<NamedModifier> = self.filters.iter().map(|f| f.create()).collect();
        for named in &mut modifiers {
            let span = named.tag.span(Stage::Response, &ctx);
            if let Err(cause) = guarded(span, named.filter.on_headers(&ctx, &mut head)).await {
                return Err(fail(
                    &ctx,
                    PipelineError::new(Stage::Response, Some(named.tag.name().to_string()), cause),
                ));
            }
        }
        head.headers.remove(CONTENT_LENGTH);

        self.dump.dump(
            &ctx,
            Dump {
                label: "response",
                start_line: head.status.to_string(),
                headers: &head.headers,
                body: &[],
            },
        );

        let (tx, rx) = mpsc::channel(*self.pipe_capacity.as_ref());
        let pump = Pump {
            ctx: Arc::clone(&ctx),
            splitter,
            reader: body_reader(body),
            modifiers,
            head: head.clone(),
            tx,
            received: BoundedCapture::from_config(&self.capture),
            handled: BoundedCapture::from_config(&self.capture),
            report: StreamReport::default(),
        };
        let completion = Arc::clone(&self.completion);
        // Outlives an unwinding pump so the client still sees the failure.
        let fallback = pump.tx.clone();
        let span = tracing::debug_span!("pump", request_id = %ctx.request_id());
        let handle = tokio::spawn(
            async move {
                let report = match AssertUnwindSafe(pump.run()).catch_unwind().await {
                    Ok(report) => report,
                    Err(payload) => {
                        let report = StreamReport::failed(PipelineError::new(
                            Stage::Response,
                            None,
                            PipelineCause::from_panic(payload),
                        ));
                        if let Some(err) = &report.error {
                            write_failure(&fallback, err).await;
                        }
                        report
                    }
                };
                drop(fallback);
                completion.stream_finished(&ctx, &report).await;
                report
            }
            .instrument(span),
        );

        parts.status = head.status;
        parts.headers = head.headers;
        Ok((Response::from_parts(parts, pipe_body(rx)), StreamHandle(handle)))
    }
}

fn fail(ctx: &RequestContext, error: PipelineError) -> Arc<PipelineError> {
    let error = Arc::new(error);
    ctx.record_error(Arc::clone(&error));
    error
}

/// Adapt an HTTP body into the buffered reader splitters consume
pub fn body_reader(body: Body) -> BodyReader {
    Box::new(StreamReader::new(
        body.into_data_stream().map_err(std::io::Error::other),
    ))
}

fn pipe_body(rx: mpsc::Receiver<PipeItem>) -> Body {
    Body::from_stream(futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

/// Read a whole error body; a read failure is described in place of the bytes
async fn read_whole(splitter: &mut dyn ChunkSplitter, reader: &mut BodyReader) -> Bytes {
    match splitter.next_chunk(reader).await {
        Ok(SplitOutcome::Chunk(bytes) | SplitOutcome::Last(bytes)) => bytes,
        Ok(SplitOutcome::End) => Bytes::new(),
        Err(e) => Bytes::from(format!("(unreadable upstream body: {e})")),
    }
}

enum Step {
    Sent,
    Swallowed,
    ClientGone,
    Failed(PipelineError),
}

struct Pump {
    ctx: Arc<RequestContext>,
    splitter: Box<dyn ChunkSplitter>,
    reader: BodyReader,
    modifiers: Vec<NamedModifier>,
    head: ResponseHead,
    tx: mpsc::Sender<PipeItem>,
    received: BoundedCapture,
    handled: BoundedCapture,
    report: StreamReport,
}

impl Pump {
    async fn run(mut self) -> StreamReport {
        let mut failure: Option<Arc<PipelineError>> = None;
        let mut client_gone = false;
        let mut pipe_failed = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.tx.closed() => {
                    client_gone = true;
                    break;
                }
                next = AssertUnwindSafe(self.splitter.next_chunk(&mut self.reader))
                    .catch_unwind() => next,
            };

            let next = match next {
                Ok(next) => next,
                Err(payload) => {
                    let err = Arc::new(PipelineError::new(
                        Stage::Response,
                        None,
                        PipelineCause::from_panic(payload),
                    ));
                    client_gone = !write_failure(&self.tx, &err).await;
                    pipe_failed = true;
                    failure = Some(err);
                    break;
                }
            };

            let (chunk, last) = match next {
                Ok(SplitOutcome::Chunk(chunk)) if chunk.is_empty() => {
                    failure = Some(upstream_failure(&self.tx, SplitError::EmptyChunk).await);
                    pipe_failed = true;
                    break;
                }
                Ok(SplitOutcome::Chunk(chunk)) => (chunk, false),
                Ok(SplitOutcome::Last(chunk)) => (chunk, true),
                Ok(SplitOutcome::End) => break,
                Err(e) => {
                    failure = Some(upstream_failure(&self.tx, e).await);
                    pipe_failed = true;
                    break;
                }
            };

            if !chunk.is_empty() {
                match self.process(chunk).await {
                    Step::Sent | Step::Swallowed => {}
                    Step::ClientGone => {
                        client_gone = true;
                        break;
                    }
                    Step::Failed(err) => {
                        let err = Arc::new(err);
                        client_gone = !write_failure(&self.tx, &err).await;
                        pipe_failed = true;
                        failure = Some(err);
                        break;
                    }
                }
            }
            if last {
                break;
            }
        }

        for named in &mut self.modifiers {
            let span = named.tag.span(Stage::Response, &self.ctx);
            match guarded(span, named.filter.on_complete(&self.ctx, &self.head)).await {
                Ok(Some(trailer)) if !trailer.is_empty() && !pipe_failed && !client_gone => {
                    self.handled.push(&trailer);
                    self.report.handled_bytes += trailer.len();
                    if self.tx.send(Ok(trailer)).await.is_err() {
                        client_gone = true;
                    }
                }
                Ok(_) => {}
                Err(cause) => {
                    let err = Arc::new(PipelineError::new(
                        Stage::Response,
                        Some(named.tag.name().to_string()),
                        cause,
                    ));
                    if !pipe_failed && !client_gone {
                        write_failure(&self.tx, &err).await;
                    }
                    pipe_failed = true;
                    failure.get_or_insert(err);
                }
            }
        }

        self.report.outcome = if failure.is_some() {
            StreamOutcome::Failed
        } else if client_gone {
            StreamOutcome::ClientGone
        } else {
            StreamOutcome::Completed
        };
        self.report.error = failure;
        self.finish_bookkeeping();
        debug!(
            request_id = %self.ctx.request_id(),
            outcome = %self.report.outcome,
            chunks = self.report.chunks,
            "response stream finished"
        );
        // Dropping `self.tx` here closes the pipe.
        self.report
    }

    /// Thread one chunk through every filter and write the result
    async fn process(&mut self, chunk: Bytes) -> Step {
        self.report.chunks += 1;
        self.report.received_bytes += chunk.len();
        self.received.push(&chunk);
        self.ctx.audit().note_once(
            keys::RESPONSE_FIRST_BYTE_AT,
            Value::from(Utc::now().to_rfc3339()),
        );

        let mut current = chunk;
        for named in &mut self.modifiers {
            let span = named.tag.span(Stage::Response, &self.ctx);
            match guarded(span, named.filter.on_body_chunk(&self.ctx, current)).await {
                Ok(out) if out.is_empty() => {
                    self.report.swallowed += 1;
                    return Step::Swallowed;
                }
                Ok(out) => current = out,
                Err(cause) => {
                    return Step::Failed(PipelineError::new(
                        Stage::Response,
                        Some(named.tag.name().to_string()),
                        cause,
                    ))
                }
            }
        }

        self.report.handled_bytes += current.len();
        self.handled.push(&current);
        match self.tx.send(Ok(current)).await {
            Ok(()) => Step::Sent,
            Err(_) => Step::ClientGone,
        }
    }

    fn finish_bookkeeping(&self) {
        let audit = self.ctx.audit();
        audit.note(
            keys::RESPONSE_LAST_BYTE_AT,
            Value::from(Utc::now().to_rfc3339()),
        );
        audit.note(keys::RESPONSE_RECEIVED, Value::from(self.received.render()));
        audit.note(keys::RESPONSE_HANDLED, Value::from(self.handled.render()));
        audit.note(
            keys::RESPONSE_RECEIVED_BYTES,
            Value::from(self.report.received_bytes),
        );
        audit.note(
            keys::RESPONSE_HANDLED_BYTES,
            Value::from(self.report.handled_bytes),
        );
        audit.note(keys::RESPONSE_CHUNKS, Value::from(self.report.chunks));
        audit.note(keys::RESPONSE_SWALLOWED, Value::from(self.report.swallowed));
    }
}

/// Write the error text and then the error itself; false if the client is gone
async fn write_failure(tx: &mpsc::Sender<PipeItem>, err: &Arc<PipelineError>) -> bool {
    if tx.send(Ok(Bytes::from(err.to_string()))).await.is_err() {
        return false;
    }
    tx.send(Err(Arc::clone(err))).await.is_ok()
}

/// Framing or upstream read failure, propagated into the pipe as an error
async fn upstream_failure(tx: &mpsc::Sender<PipeItem>, error: SplitError) -> Arc<PipelineError> {
    let err = Arc::new(PipelineError::new(
        Stage::Response,
        None,
        PipelineCause::Split(error),
    ));
    let _ = tx.send(Err(Arc::clone(&err))).await;
    err
}
