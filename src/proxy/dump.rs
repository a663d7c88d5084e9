//! Best-effort dumps of raw requests and responses
//!
//! Whether a body is inlined depends only on its declared content type.
//! Binary bodies are replaced by a placeholder, and `multipart/form-data`
//! bodies keep their textual fields while binary parts become `(binary)`.

use crate::proxy::capture::truncate;
use crate::proxy::context::RequestContext;
use crate::proxy::headers::{content_types, media_type, CONTENT_TYPE};
use http::header::{AUTHORIZATION, PROXY_AUTHORIZATION};
use http::HeaderMap;
use memchr::memmem;
use tracing::debug;

const REDACTED: &str = "[redacted]";
const SENSITIVE_HEADERS: [&str; 3] = ["x-api-key", "api-key", "cookie"];

/// One message to dump
pub struct Dump<'a> {
    /// Which side of the gateway this is, e.g. `inbound` or `outbound`
    pub label: &'a str,
    /// Request line or status line
    pub start_line: String,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
}

pub trait DumpLogger: Send + Sync {
    fn dump(&self, ctx: &RequestContext, dump: Dump<'_>);
}

/// Writes dumps as debug events on the `llm_relay::dump` target
#[derive(Debug, Clone)]
pub struct TracingDumpLogger {
    body_limit: usize,
}

impl TracingDumpLogger {
    pub fn new(body_limit: usize) -> Self {
        Self { body_limit }
    }
}

impl Default for TracingDumpLogger {
    fn default() -> Self {
        Self::new(16 * 1024)
    }
}

impl DumpLogger for TracingDumpLogger {
    fn dump(&self, ctx: &RequestContext, dump: Dump<'_>) {
        if !tracing::enabled!(target: "llm_relay::dump", tracing::Level::DEBUG) {
            return;
        }
        debug!(
            target: "llm_relay::dump",
            request_id = %ctx.request_id(),
            route = ctx.route(),
            label = dump.label,
            start_line = %dump.start_line,
            headers = %render_headers(dump.headers),
            body = %render_body(dump.headers, dump.body, self.body_limit),
            "dump"
        );
    }
}

fn render_headers(headers: &HeaderMap) -> String {
    headers
        .iter()
        .map(|(name, value)| {
            let sensitive = *name == AUTHORIZATION
                || *name == PROXY_AUTHORIZATION
                || SENSITIVE_HEADERS.contains(&name.as_str());
            let value = if sensitive {
                REDACTED
            } else {
                value.to_str().unwrap_or("(non-ascii)")
            };
            format!("{name}: {value}")
        })
        .collect::<Vec<_>>()
        .join("\r\n")
}

/// Loggable rendering of a body according to its content type
pub fn render_body(headers: &HeaderMap, body: &[u8], limit: usize) -> String {
    if body.is_empty() {
        return String::new();
    }

    let media_type = media_type(headers);
    if media_type == content_types::MULTIPART_FORM_DATA {
        if let Some(boundary) = boundary(headers) {
            let redacted = redact_multipart(body, &boundary);
            return truncate(redacted.as_bytes(), limit, limit / 4);
        }
    }

    if is_textual(&media_type) {
        truncate(body, limit, limit / 4)
    } else {
        let declared = if media_type.is_empty() {
            "unknown"
        } else {
            media_type.as_str()
        };
        format!("(binary body, {} bytes, {declared})", body.len())
    }
}

fn is_textual(media_type: &str) -> bool {
    media_type.starts_with("text/")
        || media_type.ends_with("json")
        || media_type.ends_with("xml")
        || media_type == content_types::FORM_URLENCODED
}

fn boundary(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(CONTENT_TYPE)?.to_str().ok()?;
    value.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("boundary")
            .then(|| value.trim().trim_matches('"').to_string())
    })
}

fn redact_multipart(body: &[u8], boundary: &str) -> String {
    let delimiter = format!("--{boundary}");
    let positions: Vec<usize> = memmem::find_iter(body, delimiter.as_bytes()).collect();
    let Some(&first) = positions.first() else {
        return format!("(multipart body without boundary, {} bytes)", body.len());
    };

    let mut out = String::from_utf8_lossy(&body[..first]).into_owned();
    for (i, &start) in positions.iter().enumerate() {
        let end = positions.get(i + 1).copied().unwrap_or(body.len());
        let segment = &body[start + delimiter.len()..end];
        out.push_str(&delimiter);

        match memmem::find(segment, b"\r\n\r\n") {
            Some(split) => {
                let (part_headers, content) = segment.split_at(split + 4);
                out.push_str(&String::from_utf8_lossy(part_headers));
                if part_is_binary(part_headers) {
                    out.push_str("(binary)");
                    if content.ends_with(b"\r\n") {
                        out.push_str("\r\n");
                    }
                } else {
                    out.push_str(&String::from_utf8_lossy(content));
                }
            }
            None => out.push_str(&String::from_utf8_lossy(segment)),
        }
    }
    out
}

fn part_is_binary(part_headers: &[u8]) -> bool {
    let part_headers = String::from_utf8_lossy(part_headers).to_ascii_lowercase();
    if part_headers.contains("filename=") {
        return true;
    }
    part_headers
        .lines()
        .find_map(|line| line.strip_prefix("content-type:"))
        .map(|value| {
            let media_type = value.split(';').next().unwrap_or_default().trim();
            !is_textual(media_type)
        })
        .unwrap_or(false)
}
