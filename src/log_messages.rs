//! Log message constants
//!
//! Messages shared by more than one call site, or worth grepping for, live
//! here so the wording stays consistent across the crate.

/// Application startup and lifecycle messages
pub mod application {
    pub const STARTING: &str = "Starting llm_relay";
    pub const LISTENING: &str = "Gateway listening";
    pub const SHUTTING_DOWN: &str = "Shutdown signal received, draining connections";
    pub const STOPPED: &str = "Gateway stopped";
}

/// Audit path messages
pub mod audit {
    pub const PROCESSOR_STARTED: &str = "Audit path processor started";
    pub const PROCESSOR_STOPPED: &str = "Audit path processor stopped";
    pub const UNREADABLE_RECORD: &str = "Discarding unreadable audit record";
    pub const FLUSH_FAILED: &str = "Audit flush failed";
}

/// Request/response processing messages
pub mod request_processing {
    pub const REQUEST_FAILED: &str = "Request failed";
    pub const REQUEST_REJECTED: &str = "Request rejected";
    pub const STREAM_FAILED: &str = "Response stream failed";
    pub const UPSTREAM_RESPONDED: &str = "Upstream responded";
}
