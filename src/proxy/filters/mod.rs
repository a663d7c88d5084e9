//! Built-in filters
//!
//! Generic building blocks only. Business filters are registered by the
//! embedding application through [`crate::proxy::registry::FilterRegistry::register`].

pub mod headers;
pub mod usage_audit;

pub use headers::{HeaderEdits, RequestHeadersFilter, ResponseHeadersFilter};
pub use usage_audit::UsageAuditFilter;
