//! Token-usage extraction from Anthropic response bodies.
//!
//! The body is either a single JSON document or an SSE stream. Both carry the
//! same `usage` object; in streams the `message_start` event reports input and
//! cache tokens while each `message_delta` carries the cumulative output-token
//! count, so a later delta overrides an earlier one.

use serde_json::Value;

/// Token counts observed in one upstream response. Missing fields are zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_creation_tokens
            + self.cache_read_tokens
    }

    /// Parse an Anthropic `usage` JSON object.
    pub fn from_json(value: &Value) -> Self {
        let field = |name: &str| value.get(name).and_then(Value::as_u64).unwrap_or(0);
        Self {
            input_tokens: field("input_tokens"),
            output_tokens: field("output_tokens"),
            cache_creation_tokens: field("cache_creation_input_tokens"),
            cache_read_tokens: field("cache_read_input_tokens"),
        }
    }

    /// Merge a later observation into this one. Output tokens are cumulative
    /// in Anthropic deltas, so nonzero later values replace earlier ones.
    fn merge(&mut self, later: &TokenUsage) {
        if later.input_tokens > 0 {
            self.input_tokens = later.input_tokens;
        }
        if later.output_tokens > 0 {
            self.output_tokens = later.output_tokens;
        }
        if later.cache_creation_tokens > 0 {
            self.cache_creation_tokens = later.cache_creation_tokens;
        }
        if later.cache_read_tokens > 0 {
            self.cache_read_tokens = later.cache_read_tokens;
        }
    }
}

/// Extract token usage from a full response body.
///
/// Returns None when the body carries no usage information at all; the caller
/// records zeros in that case.
pub fn extract_usage(body: &[u8]) -> Option<TokenUsage> {
    let text = std::str::from_utf8(body).ok()?;

    if let Ok(doc) = serde_json::from_str::<Value>(text)
        && let Some(usage) = doc.get("usage")
    {
        return Some(TokenUsage::from_json(usage));
    }

    extract_from_sse(text)
}

fn extract_from_sse(text: &str) -> Option<TokenUsage> {
    let mut found = false;
    let mut usage = TokenUsage::default();

    for line in text.split('\n') {
        let line = line.trim();
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let Ok(event) = serde_json::from_str::<Value>(data.trim()) else {
            continue;
        };

        match event.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                if let Some(u) = event.get("message").and_then(|m| m.get("usage")) {
                    usage.merge(&TokenUsage::from_json(u));
                    found = true;
                }
            }
            Some("message_delta") => {
                if let Some(u) = event.get("usage") {
                    usage.merge(&TokenUsage::from_json(u));
                    found = true;
                }
            }
            _ => {}
        }
    }

    found.then_some(usage)
}
