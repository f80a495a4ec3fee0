//! OpenAI-compatible API format conversion.
//!
//! Converts OpenAI chat completion requests to Anthropic messages requests
//! and Anthropic responses back to the OpenAI shape.

use axum::http::{HeaderMap, HeaderValue, header};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::OpenAiConfig;
use crate::constants::{DEFAULT_OPENAI_MAX_TOKENS, OPENAI_FORWARD_USER_AGENT};

/// System/developer messages containing these markers reveal an OpenAI
/// wrapper identity and are dropped rather than forwarded.
const WRAPPER_MARKERS: &[&str] = &["Current model:", "GPT", "You are a helpful assistant"];

// ============================================================================
// OpenAI Request Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct OpenAiChatRequest {
    pub model: Option<String>,
    pub messages: Vec<OpenAiMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    /// Scalar or array of stop sequences
    pub stop: Option<Value>,
    pub stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiMessage {
    pub role: String,
    #[serde(default)]
    pub content: Value,
}

// ============================================================================
// Anthropic Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AnthropicResponse {
    pub model: String,
    #[serde(default)]
    pub content: Vec<Value>,
    pub stop_reason: Option<String>,
    pub usage: AnthropicUsage,
}

#[derive(Debug, Default, Deserialize)]
pub struct AnthropicUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

// ============================================================================
// OpenAI Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct OpenAiChatResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<OpenAiChoice>,
    pub usage: OpenAiUsage,
}

#[derive(Debug, Serialize)]
pub struct OpenAiChoice {
    pub index: u32,
    pub message: OpenAiResponseMessage,
    pub finish_reason: String,
}

#[derive(Debug, Serialize)]
pub struct OpenAiResponseMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct OpenAiUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

// ============================================================================
// Transform Functions
// ============================================================================

pub fn chatcmpl_id() -> String {
    format!("chatcmpl-{}", crate::proxy::request_id())
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Map an Anthropic stop_reason to the OpenAI finish_reason.
pub fn finish_reason(stop_reason: &str) -> &'static str {
    if stop_reason == "end_turn" { "stop" } else { "length" }
}

fn content_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn reveals_wrapper(text: &str) -> bool {
    WRAPPER_MARKERS.iter().any(|marker| text.contains(marker))
}

/// Transform an OpenAI chat request into an Anthropic messages body.
///
/// The model is resolved through the configured mapping (falling back to the
/// default model, then pass-through). System and developer messages that
/// reveal the wrapper are dropped; the rest are coerced to user messages.
pub fn transform_openai_request(req: OpenAiChatRequest, openai: &OpenAiConfig) -> Value {
    let mut messages: Vec<Value> = Vec::new();

    for msg in req.messages {
        match msg.role.as_str() {
            "system" | "developer" => {
                if reveals_wrapper(&content_text(&msg.content)) {
                    continue;
                }
                messages.push(json!({ "role": "user", "content": msg.content }));
            }
            _ => {
                messages.push(json!({ "role": msg.role, "content": msg.content }));
            }
        }
    }

    let model = openai.resolve_model(req.model.as_deref().unwrap_or_default());

    let mut request = json!({
        "model": model,
        "max_tokens": req.max_tokens.unwrap_or(DEFAULT_OPENAI_MAX_TOKENS),
        "messages": messages,
    });

    if let Some(t) = req.temperature {
        request["temperature"] = json!(t);
    }
    if let Some(p) = req.top_p {
        request["top_p"] = json!(p);
    }
    if let Some(stop) = req.stop {
        request["stop_sequences"] = match stop {
            Value::Array(seq) => Value::Array(seq),
            scalar => Value::Array(vec![scalar]),
        };
    }
    if let Some(s) = req.stream {
        request["stream"] = json!(s);
    }

    request
}

/// Transform a non-streaming Anthropic response to the OpenAI shape.
pub fn transform_openai_response(resp: AnthropicResponse) -> OpenAiChatResponse {
    let text: String = resp
        .content
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect();

    OpenAiChatResponse {
        id: chatcmpl_id(),
        object: "chat.completion".to_string(),
        created: unix_now(),
        model: resp.model,
        choices: vec![OpenAiChoice {
            index: 0,
            message: OpenAiResponseMessage {
                role: "assistant".to_string(),
                content: text,
            },
            finish_reason: finish_reason(resp.stop_reason.as_deref().unwrap_or("end_turn"))
                .to_string(),
        }],
        usage: OpenAiUsage {
            prompt_tokens: resp.usage.input_tokens,
            completion_tokens: resp.usage.output_tokens,
            total_tokens: resp.usage.input_tokens + resp.usage.output_tokens,
        },
    }
}

/// Remove browser-origin headers before forwarding and pin the User-Agent to
/// a stable identifier.
pub fn scrub_browser_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        let lower = name.as_str();
        if lower == "referer"
            || lower == "origin"
            || lower.starts_with("sec-fetch-")
            || lower.starts_with("sec-ch-ua")
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out.insert(
        header::USER_AGENT,
        HeaderValue::from_static(OPENAI_FORWARD_USER_AGENT),
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn openai_config() -> OpenAiConfig {
        serde_json::from_str(
            r#"{
                "enabled": true,
                "models": {"gpt-5-mini": "claude-3-7-sonnet-20250219"},
                "defaultModel": "claude-3-5-haiku-20241022"
            }"#,
        )
        .unwrap()
    }

    fn request(body: &str) -> OpenAiChatRequest {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn maps_model_and_defaults() {
        let req = request(
            r#"{"model":"gpt-5-mini","stream":true,"messages":[{"role":"user","content":"hi"}]}"#,
        );
        let body = transform_openai_request(req, &openai_config());
        assert_eq!(body["model"], "claude-3-7-sonnet-20250219");
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["content"], "hi");
    }

    #[test]
    fn unmapped_model_uses_default() {
        let req = request(r#"{"model":"gpt-4o","messages":[]}"#);
        let body = transform_openai_request(req, &openai_config());
        assert_eq!(body["model"], "claude-3-5-haiku-20241022");
    }

    #[test]
    fn wrapper_system_messages_are_dropped_others_coerced() {
        let req = request(
            r#"{
                "model": "gpt-5-mini",
                "messages": [
                    {"role": "system", "content": "You are a helpful assistant"},
                    {"role": "developer", "content": "Current model: gpt-5-mini"},
                    {"role": "system", "content": "Answer in French."},
                    {"role": "user", "content": "hi"}
                ]
            }"#,
        );
        let body = transform_openai_request(req, &openai_config());
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[0]["content"], "Answer in French.");
        assert_eq!(messages[1]["content"], "hi");
    }

    #[test]
    fn scalar_stop_becomes_one_element_sequence() {
        let req = request(r#"{"model":"gpt-5-mini","messages":[],"stop":"END"}"#);
        let body = transform_openai_request(req, &openai_config());
        assert_eq!(body["stop_sequences"], json!(["END"]));

        let req = request(r#"{"model":"gpt-5-mini","messages":[],"stop":["a","b"]}"#);
        let body = transform_openai_request(req, &openai_config());
        assert_eq!(body["stop_sequences"], json!(["a", "b"]));
    }

    #[test]
    fn sampling_params_are_copied() {
        let req = request(
            r#"{"model":"gpt-5-mini","messages":[],"temperature":0.5,"top_p":0.9,"max_tokens":128}"#,
        );
        let body = transform_openai_request(req, &openai_config());
        assert_eq!(body["temperature"], 0.5);
        assert_eq!(body["top_p"], 0.9);
        assert_eq!(body["max_tokens"], 128);
    }

    #[test]
    fn response_transform_concatenates_text() {
        let resp: AnthropicResponse = serde_json::from_str(
            r#"{
                "id": "msg_01",
                "model": "claude-3-7-sonnet-20250219",
                "content": [
                    {"type": "text", "text": "Hello"},
                    {"type": "tool_use", "id": "t1", "name": "f", "input": {}},
                    {"type": "text", "text": ", world"}
                ],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 10, "output_tokens": 4}
            }"#,
        )
        .unwrap();
        let out = transform_openai_response(resp);
        assert!(out.id.starts_with("chatcmpl-"));
        assert_eq!(out.object, "chat.completion");
        assert_eq!(out.choices[0].message.content, "Hello, world");
        assert_eq!(out.choices[0].finish_reason, "stop");
        assert_eq!(out.usage.prompt_tokens, 10);
        assert_eq!(out.usage.completion_tokens, 4);
        assert_eq!(out.usage.total_tokens, 14);
    }

    #[test]
    fn non_end_turn_maps_to_length() {
        assert_eq!(finish_reason("max_tokens"), "length");
        assert_eq!(finish_reason("end_turn"), "stop");
    }

    #[test]
    fn browser_headers_are_scrubbed() {
        let mut headers = HeaderMap::new();
        headers.insert("origin", HeaderValue::from_static("https://evil.example"));
        headers.insert("referer", HeaderValue::from_static("https://evil.example/page"));
        headers.insert("sec-fetch-mode", HeaderValue::from_static("cors"));
        headers.insert("sec-ch-ua-platform", HeaderValue::from_static("macOS"));
        headers.insert("user-agent", HeaderValue::from_static("Mozilla/5.0"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        let out = scrub_browser_headers(&headers);
        assert!(out.get("origin").is_none());
        assert!(out.get("referer").is_none());
        assert!(out.get("sec-fetch-mode").is_none());
        assert!(out.get("sec-ch-ua-platform").is_none());
        assert_eq!(out.get("content-type").unwrap(), "application/json");
        assert_eq!(out.get("user-agent").unwrap(), OPENAI_FORWARD_USER_AGENT);
    }
}
