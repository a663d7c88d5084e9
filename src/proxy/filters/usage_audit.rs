//! Token usage accounting for JSON and SSE responses
//!
//! Usage fields differ per provider family; every shape below is recognised
//! and the largest count seen wins, since streamed counters are cumulative.
//! The bytes themselves pass through untouched.

use crate::proxy::audit::{keys, AuditSink};
use crate::proxy::context::RequestContext;
use crate::proxy::filter::{FilterError, ModifierFactory, ResponseHead, ResponseModifier};
use crate::proxy::registry::{FilterHandle, FilterSpec};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;

pub const KIND: &str = "usage_audit";

const INPUT_FIELDS: [&str; 4] = [
    "input_tokens",
    "prompt_tokens",
    "inputTokenCount",
    "prompt_token_count",
];
const OUTPUT_FIELDS: [&str; 4] = [
    "output_tokens",
    "completion_tokens",
    "outputTokenCount",
    "generation_token_count",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input: Option<u64>,
    pub output: Option<u64>,
}

impl TokenUsage {
    fn merge(&mut self, other: TokenUsage) {
        self.input = self.input.max(other.input);
        self.output = self.output.max(other.output);
    }
}

/// Token usage reported by one JSON document, whichever provider shape it has
pub fn extract_usage(doc: &Value) -> TokenUsage {
    let mut usage = TokenUsage::default();

    let nested = [
        doc.get("usage"),
        doc.get("message").and_then(|m| m.get("usage")),
        doc.get("amazon-bedrock-invocationMetrics"),
        Some(doc),
    ];
    for object in nested.into_iter().flatten() {
        usage.merge(TokenUsage {
            input: first_count(object, &INPUT_FIELDS),
            output: first_count(object, &OUTPUT_FIELDS),
        });
    }

    // Titan reports input at the top level and output per result.
    if let Some(input) = doc.get("inputTextTokenCount").and_then(Value::as_u64) {
        let output = doc
            .get("results")
            .and_then(Value::as_array)
            .map(|results| {
                results
                    .iter()
                    .filter_map(|r| r.get("tokenCount").and_then(Value::as_u64))
                    .sum::<u64>()
            });
        usage.merge(TokenUsage {
            input: Some(input),
            output,
        });
    }

    usage
}

fn first_count(object: &Value, fields: &[&str]) -> Option<u64> {
    fields
        .iter()
        .find_map(|field| object.get(*field).and_then(Value::as_u64))
}

fn model_of(doc: &Value) -> Option<String> {
    doc.get("model")
        .or_else(|| doc.get("message").and_then(|m| m.get("model")))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Per-stream usage accumulator
#[derive(Debug, Default)]
pub struct UsageAuditFilter {
    usage: TokenUsage,
    model: Option<String>,
}

impl UsageAuditFilter {
    fn absorb(&mut self, doc: &Value) {
        self.usage.merge(extract_usage(doc));
        if self.model.is_none() {
            self.model = model_of(doc);
        }
    }

    fn scan(&mut self, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk);
        let trimmed = text.trim_start();
        if trimmed.starts_with('{') {
            if let Ok(doc) = serde_json::from_str::<Value>(trimmed) {
                self.absorb(&doc);
                return;
            }
        }

        for line in text.lines() {
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() || data == "[DONE]" {
                continue;
            }
            if let Ok(doc) = serde_json::from_str::<Value>(data) {
                self.absorb(&doc);
            }
        }
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }
}

#[async_trait]
impl ResponseModifier for UsageAuditFilter {
    async fn on_body_chunk(
        &mut self,
        _ctx: &RequestContext,
        chunk: Bytes,
    ) -> Result<Bytes, FilterError> {
        self.scan(&chunk);
        Ok(chunk)
    }

    async fn on_complete(
        &mut self,
        ctx: &RequestContext,
        _head: &ResponseHead,
    ) -> Result<Option<Bytes>, FilterError> {
        let audit = ctx.audit();
        if let Some(input) = self.usage.input {
            audit.note(keys::USAGE_INPUT_TOKENS, Value::from(input));
        }
        if let Some(output) = self.usage.output {
            audit.note(keys::USAGE_OUTPUT_TOKENS, Value::from(output));
        }
        if let (None, Some(model)) = (ctx.model(), self.model.take()) {
            ctx.set_model(model);
        }
        Ok(None)
    }
}

pub fn build(_spec: &FilterSpec) -> Result<FilterHandle, FilterError> {
    let factory: ModifierFactory =
        Arc::new(|| -> Box<dyn ResponseModifier> { Box::new(UsageAuditFilter::default()) });
    Ok(FilterHandle::Response(factory))
}
