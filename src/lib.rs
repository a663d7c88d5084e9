//! llm_relay - a streaming reverse proxy for LLM backends
//!
//! Requests are matched to a configured route, rewritten by an ordered chain
//! of request filters and forwarded upstream. Response bodies are split into
//! framing-aware chunks (SSE events, AWS event-stream frames, lines or fixed
//! blocks) and pumped through an ordered chain of response filters while the
//! bytes are still arriving. Every request produces one audit record.

pub mod application;
pub mod config;
pub mod error;
pub mod log_messages;
pub mod proxy;

pub use application::Application;
pub use error::{Error, Result};
