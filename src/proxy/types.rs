//! Type definitions for the proxy module

use crate::proxy::error_boundary::PipelineError;
use crate::proxy::transport::TransportError;
use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

// ========== Size and Capacity Types ==========

/// Maximum size for inbound request bodies in bytes
#[nutype(
    derive(Clone, Copy, Debug, Display, PartialEq, Deserialize, Serialize, TryFrom, AsRef),
    validate(predicate = |size: &usize| *size > 0)
)]
pub struct RequestSizeLimit(usize);

/// Maximum size of an upstream error body read by the gateway
#[nutype(
    derive(Clone, Copy, Debug, Display, PartialEq, Deserialize, Serialize, TryFrom, AsRef),
    validate(predicate = |size: &usize| *size > 0)
)]
pub struct ResponseSizeLimit(usize);

/// Read size used by the fixed-size splitter
#[nutype(
    derive(Clone, Copy, Debug, Display, PartialEq, Deserialize, Serialize, TryFrom, AsRef),
    validate(predicate = |size: &usize| *size > 0)
)]
pub struct ChunkSize(usize);

/// Largest event-stream frame accepted, prelude and trailer included
#[nutype(
    derive(Clone, Copy, Debug, Display, PartialEq, Deserialize, Serialize, TryFrom, AsRef),
    validate(predicate = |size: &usize| *size >= 16 && *size <= u32::MAX as usize)
)]
pub struct MaxFrameSize(usize);

/// Number of chunks that may sit in the response pipe before the pump waits
#[nutype(
    derive(Clone, Copy, Debug, Display, PartialEq, Deserialize, Serialize, TryFrom, AsRef),
    validate(predicate = |capacity: &usize| *capacity > 0)
)]
pub struct PipeCapacity(usize);

/// Bytes retained at the head or the tail of an audit body capture
#[nutype(derive(Clone, Copy, Debug, Display, PartialEq, Deserialize, Serialize, From, AsRef))]
pub struct CaptureLength(usize);

/// Total buffer size for ring buffer in bytes
#[nutype(
    derive(Clone, Copy, Debug, Display, Deserialize, Serialize, TryFrom, AsRef),
    validate(predicate = |size: &usize| *size > 0 && size.is_power_of_two())
)]
pub struct BufferSize(usize);

/// Size of individual slots in ring buffer in bytes
#[nutype(
    derive(Clone, Copy, Debug, Display, Deserialize, Serialize, TryFrom, AsRef),
    validate(predicate = |size: &usize| *size > 0)
)]
pub struct SlotSize(usize);

/// Number of events dropped due to buffer overflow
#[nutype(derive(Clone, Copy, Debug, Display, Deserialize, Serialize, From, AsRef))]
pub struct DroppedEventCount(u64);

/// Timestamp in nanoseconds since epoch
#[nutype(derive(Clone, Copy, Debug, Display, Deserialize, Serialize, From, AsRef))]
pub struct TimestampNanos(u64);

// ========== Identity Types ==========

/// Request ID for correlation between the pipelines and the audit path
#[nutype(derive(
    Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Deserialize, Serialize, From, AsRef
))]
pub struct RequestId(Uuid);

impl RequestId {
    /// Create a new RequestId with a v7 UUID
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }

    /// Parse an inbound `x-request-id` value, accepting any UUID version
    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value).ok().map(Self::new)
    }
}

/// Upstream base URL a route forwards to
#[nutype(
    derive(Clone, Debug, Display, PartialEq, Deserialize, Serialize, TryFrom, AsRef),
    validate(predicate = |s: &str| s.starts_with("http://") || s.starts_with("https://"))
)]
pub struct TargetUrl(String);

/// Path prefix a route is mounted on
#[nutype(
    derive(Clone, Debug, Display, PartialEq, Eq, Hash, Deserialize, Serialize, TryFrom, AsRef),
    validate(predicate = |s: &str| s.starts_with('/'))
)]
pub struct RoutePrefix(String);

// ========== Configuration ==========

/// Gateway configuration
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Maximum inbound request body size in bytes
    pub max_request_size: RequestSizeLimit,
    /// Maximum upstream error body size read for the error envelope
    pub max_response_size: ResponseSizeLimit,
    /// Upstream round-trip timeout (headers only, streaming bodies are not bounded)
    pub request_timeout: Duration,
    /// Bounded pipe between the body pump and the client
    pub pipe_capacity: PipeCapacity,
    /// Fixed-size splitter read size
    pub chunk_size: ChunkSize,
    /// Event-stream frame ceiling
    pub max_event_frame: MaxFrameSize,
    /// Audit body capture limits
    pub capture: CaptureConfig,
    /// Ring buffer configuration
    pub ring_buffer: RingBufferConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_request_size: RequestSizeLimit::try_new(10 * 1024 * 1024).expect("10MB is valid"),
            max_response_size: ResponseSizeLimit::try_new(1024 * 1024).expect("1MB is valid"),
            request_timeout: Duration::from_secs(60),
            pipe_capacity: PipeCapacity::try_new(16).expect("16 is valid"),
            chunk_size: ChunkSize::try_new(DEFAULT_CHUNK_SIZE).expect("32KB is valid"),
            max_event_frame: MaxFrameSize::try_new(16 * 1024 * 1024).expect("16MB is valid"),
            capture: CaptureConfig::default(),
            ring_buffer: RingBufferConfig::default(),
        }
    }
}

/// Head/tail limits for the audit copies of request and response bodies
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct CaptureConfig {
    pub head: CaptureLength,
    pub tail: CaptureLength,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            head: CaptureLength::from(4 * 1024),
            tail: CaptureLength::from(1024),
        }
    }
}

/// Ring buffer configuration
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RingBufferConfig {
    /// Total buffer size in bytes
    pub buffer_size: BufferSize,
    /// Size of each slot in bytes
    pub slot_size: SlotSize,
}

impl Default for RingBufferConfig {
    fn default() -> Self {
        Self {
            buffer_size: BufferSize::try_new(64 * 1024 * 1024).expect("64MB is valid power of 2"),
            slot_size: SlotSize::try_new(64 * 1024).expect("64KB is valid"),
        }
    }
}

// ========== Constants ==========

/// Default read size of the fixed-size splitter
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Header name for request ID
pub const REQUEST_ID_HEADER: &str = "x-request-id";

// ========== Errors ==========

/// Errors surfaced to the client by the gateway
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Request too large (max: {max_size} bytes)")]
    RequestTooLarge { max_size: RequestSizeLimit },

    #[error("No route for path: {0}")]
    NoRoute(String),

    #[error("Invalid target URL: {0}")]
    InvalidTargetUrl(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Pipeline(Arc<PipelineError>),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<Arc<PipelineError>> for ProxyError {
    fn from(err: Arc<PipelineError>) -> Self {
        Self::Pipeline(err)
    }
}

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;
