//! Request-scoped storage shared by the request phase and the body pump
//!
//! Stages attach what they discover (the chosen framing, the upstream
//! content-encoding, a pipeline failure, audit notes) as typed fields. A
//! context belongs to exactly one request; the only concurrent users are that
//! request's handler task and its body pump task.

use crate::log_messages::audit;
use crate::proxy::audit::{AuditNotes, AuditRecord, AuditWriter};
use crate::proxy::error_boundary::PipelineError;
use crate::proxy::splitter::{ChunkSplitter, SplitterKind};
use crate::proxy::types::RequestId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

pub struct RequestContext {
    request_id: RequestId,
    route: String,
    started_at: DateTime<Utc>,
    streaming: AtomicBool,
    splitter: Mutex<Option<Box<dyn ChunkSplitter>>>,
    splitter_kind: Mutex<Option<SplitterKind>>,
    response_encoding: Mutex<Option<String>>,
    pipeline_error: Mutex<Option<Arc<PipelineError>>>,
    model: Mutex<Option<String>>,
    session: Mutex<Option<String>>,
    audit: AuditNotes,
    audit_flushed: AtomicBool,
}

impl RequestContext {
    pub fn new(request_id: RequestId, route: impl Into<String>) -> Self {
        Self {
            request_id,
            route: route.into(),
            started_at: Utc::now(),
            streaming: AtomicBool::new(false),
            splitter: Mutex::new(None),
            splitter_kind: Mutex::new(None),
            response_encoding: Mutex::new(None),
            pipeline_error: Mutex::new(None),
            model: Mutex::new(None),
            session: Mutex::new(None),
            audit: AuditNotes::default(),
            audit_flushed: AtomicBool::new(false),
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    pub fn set_streaming(&self, streaming: bool) {
        self.streaming.store(streaming, Ordering::Release);
    }

    /// Park a splitter for the response phase to pick up
    pub fn store_splitter(&self, splitter: Box<dyn ChunkSplitter>) {
        *self.splitter_kind.lock() = Some(splitter.kind());
        *self.splitter.lock() = Some(splitter);
    }

    /// Hand the parked splitter to its single user
    pub fn take_splitter(&self) -> Option<Box<dyn ChunkSplitter>> {
        self.splitter.lock().take()
    }

    /// Framing chosen for this request's response, once known
    pub fn splitter_kind(&self) -> Option<SplitterKind> {
        *self.splitter_kind.lock()
    }

    pub fn set_splitter_kind(&self, kind: SplitterKind) {
        *self.splitter_kind.lock() = Some(kind);
    }

    /// Content-encoding of the upstream body, recorded when it was stripped
    pub fn response_encoding(&self) -> Option<String> {
        self.response_encoding.lock().clone()
    }

    pub fn set_response_encoding(&self, encoding: String) {
        *self.response_encoding.lock() = Some(encoding);
    }

    /// Remember the failure that ended a pipeline; the first one wins
    pub fn record_error(&self, error: Arc<PipelineError>) {
        let mut slot = self.pipeline_error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    pub fn pipeline_error(&self) -> Option<Arc<PipelineError>> {
        self.pipeline_error.lock().clone()
    }

    pub fn model(&self) -> Option<String> {
        self.model.lock().clone()
    }

    pub fn set_model(&self, model: String) {
        *self.model.lock() = Some(model);
    }

    pub fn session(&self) -> Option<String> {
        self.session.lock().clone()
    }

    pub fn set_session(&self, session: String) {
        *self.session.lock() = Some(session);
    }

    pub fn audit(&self) -> &AuditNotes {
        &self.audit
    }

    pub fn audit_flushed(&self) -> bool {
        self.audit_flushed.load(Ordering::Acquire)
    }

    /// Persist the accumulated notes; only the first call writes
    pub async fn flush_audit(&self, writer: &dyn AuditWriter) -> bool {
        if self.audit_flushed.swap(true, Ordering::AcqRel) {
            return false;
        }

        let record = AuditRecord {
            request_id: self.request_id,
            route: self.route.clone(),
            model: self.model(),
            session: self.session(),
            started_at: self.started_at,
            flushed_at: Utc::now(),
            notes: self.audit.snapshot(),
        };
        if let Err(e) = writer.write(record).await {
            warn!(request_id = %self.request_id, error = %e, "{}", audit::FLUSH_FAILED);
        }
        true
    }
}
