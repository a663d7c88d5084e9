//! Audit notes accumulated per request and the writers that persist them

use crate::proxy::ring_buffer::RingBuffer;
use crate::proxy::types::RequestId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Well-known note keys
pub mod keys {
    pub const REQUEST_METHOD: &str = "request.method";
    pub const REQUEST_PATH: &str = "request.path";
    pub const REQUEST_UPSTREAM: &str = "request.upstream";
    pub const REQUEST_BODY: &str = "request.body";
    pub const REQUEST_BODY_BYTES: &str = "request.body_bytes";
    pub const RESPONSE_STATUS: &str = "response.status";
    pub const RESPONSE_FRAMING: &str = "response.framing";
    pub const RESPONSE_FIRST_BYTE_AT: &str = "response.first_byte_at";
    pub const RESPONSE_LAST_BYTE_AT: &str = "response.last_byte_at";
    pub const RESPONSE_RECEIVED: &str = "response.body.received";
    pub const RESPONSE_HANDLED: &str = "response.body.handled";
    pub const RESPONSE_RECEIVED_BYTES: &str = "response.body.received_bytes";
    pub const RESPONSE_HANDLED_BYTES: &str = "response.body.handled_bytes";
    pub const RESPONSE_CHUNKS: &str = "response.body.chunks";
    pub const RESPONSE_SWALLOWED: &str = "response.body.swallowed_chunks";
    pub const RESPONSE_OUTCOME: &str = "response.outcome";
    pub const ERROR_STAGE: &str = "error.stage";
    pub const ERROR_FILTER: &str = "error.filter";
    pub const ERROR_MESSAGE: &str = "error.message";
    pub const FILTERS_APPLIED: &str = "filters.applied";
    pub const USAGE_INPUT_TOKENS: &str = "usage.input_tokens";
    pub const USAGE_OUTPUT_TOKENS: &str = "usage.output_tokens";
}

/// Structured metadata recorded about one request
pub trait AuditSink: Send + Sync {
    /// Set `key`, replacing any previous value
    fn note(&self, key: &str, value: Value);

    /// Append text to the string at `key`, creating it if absent
    fn note_append(&self, key: &str, value: &str);

    /// Set `key` only if it has never been set
    fn note_once(&self, key: &str, value: Value);
}

/// In-memory notes for a single request
#[derive(Debug, Default)]
pub struct AuditNotes {
    notes: Mutex<BTreeMap<String, Value>>,
}

impl AuditNotes {
    pub fn get(&self, key: &str) -> Option<Value> {
        self.notes.lock().get(key).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.notes.lock().clone()
    }
}

impl AuditSink for AuditNotes {
    fn note(&self, key: &str, value: Value) {
        self.notes.lock().insert(key.to_string(), value);
    }

    fn note_append(&self, key: &str, value: &str) {
        let mut notes = self.notes.lock();
        match notes.get_mut(key) {
            Some(Value::String(existing)) => existing.push_str(value),
            Some(other) => *other = Value::String(format!("{}{value}", value_text(other))),
            None => {
                notes.insert(key.to_string(), Value::String(value.to_string()));
            }
        }
    }

    fn note_once(&self, key: &str, value: Value) {
        self.notes.lock().entry(key.to_string()).or_insert(value);
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// What gets persisted for a request when its audit is flushed
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditRecord {
    pub request_id: RequestId,
    pub route: String,
    pub model: Option<String>,
    pub session: Option<String>,
    pub started_at: DateTime<Utc>,
    pub flushed_at: DateTime<Utc>,
    pub notes: BTreeMap<String, Value>,
}

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Audit buffer overflow: {0} records overwritten")]
    Overflow(u64),

    #[error("Audit write failed: {0}")]
    Write(String),
}

/// Persists flushed audit records
#[async_trait]
pub trait AuditWriter: Send + Sync {
    async fn write(&self, record: AuditRecord) -> Result<(), AuditError>;
}

/// Hands records to the audit path through the lock-free ring buffer
pub struct RingBufferAuditWriter {
    ring_buffer: Arc<RingBuffer>,
}

impl RingBufferAuditWriter {
    pub fn new(ring_buffer: Arc<RingBuffer>) -> Self {
        Self { ring_buffer }
    }
}

#[async_trait]
impl AuditWriter for RingBufferAuditWriter {
    async fn write(&self, record: AuditRecord) -> Result<(), AuditError> {
        let serialized = serde_json::to_vec(&record)?;
        debug!(request_id = %record.request_id, bytes = serialized.len(), "queueing audit record");
        self.ring_buffer
            .write(record.request_id, &serialized)
            .map_err(AuditError::Overflow)
    }
}
