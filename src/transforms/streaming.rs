//! SSE stream pipelines.
//!
//! `passthrough_with_meter` forwards upstream bytes to the client verbatim
//! (bit-for-bit, no buffering ahead of the client) while tee-ing them into
//! the metering buffer. `anthropic_to_openai_stream` translates Anthropic
//! streaming events into OpenAI chat.completion.chunk frames, terminated by
//! `data: [DONE]`, with the same metering on the raw upstream bytes.
//!
//! In both cases the usage record is appended strictly after the final body
//! byte has been yielded; a dropped stream (client disconnect) still records
//! whatever was observed.

use std::time::Duration;

use async_stream::stream;
use bytes::Bytes;
use futures_util::Stream;
use serde_json::{Value, json};
use tokio::time::interval;

use super::openai_compat::{chatcmpl_id, finish_reason, unix_now};
use crate::proxy::{MeterGuard, RequestMeter};

/// Keep-alive interval for translated SSE streams (prevents intermediary
/// timeouts during long generations).
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// SSE comment ignored by clients.
const KEEP_ALIVE_COMMENT: &str = ": keep-alive\n\n";

/// Forward the upstream body unchanged, metering on completion.
pub fn passthrough_with_meter<S, E>(
    body: S,
    meter: RequestMeter,
    status_code: u16,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    stream! {
        use futures_util::StreamExt;

        let mut guard = MeterGuard::new(meter, status_code);
        let mut body = std::pin::pin!(body);

        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(chunk) => {
                    guard.push(&chunk);
                    yield Ok(chunk);
                }
                Err(e) => {
                    // Headers are already out; terminate the stream and let
                    // the meter keep what was observed.
                    yield Err(std::io::Error::other(e));
                    break;
                }
            }
        }

        guard.finish().await;
    }
}

/// Translate one Anthropic stream event into zero or more OpenAI SSE frames.
fn translate_event(event: &Value, chat_id: &str, created: u64, model: &str) -> Vec<String> {
    let chunk = |delta: Value, finish: Value| {
        let frame = json!({
            "id": chat_id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish,
            }],
        });
        format!("data: {frame}\n\n")
    };

    match event.get("type").and_then(Value::as_str) {
        Some("message_start") => {
            vec![chunk(
                json!({"role": "assistant", "content": ""}),
                Value::Null,
            )]
        }
        Some("content_block_delta") => {
            match event
                .get("delta")
                .and_then(|d| d.get("text"))
                .and_then(Value::as_str)
            {
                Some(text) => vec![chunk(json!({"content": text}), Value::Null)],
                None => Vec::new(),
            }
        }
        Some("message_delta") => {
            match event
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(Value::as_str)
            {
                Some(stop_reason) => {
                    vec![chunk(json!({}), json!(finish_reason(stop_reason)))]
                }
                None => Vec::new(),
            }
        }
        Some("message_stop") => vec![chunk(json!({}), json!("stop"))],
        Some("error") => {
            // Upstream error mid-stream: re-emit as a single error chunk.
            let error = event.get("error").cloned().unwrap_or_else(|| event.clone());
            vec![format!("data: {}\n\n", json!({"error": error}))]
        }
        _ => Vec::new(),
    }
}

/// Translate an Anthropic SSE stream into OpenAI chat.completion.chunk
/// frames, ending with `data: [DONE]`. Usage is metered from the raw
/// Anthropic bytes after the upstream stream ends.
pub fn anthropic_to_openai_stream<S, E>(
    body: S,
    model: String,
    meter: RequestMeter,
    status_code: u16,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    stream! {
        use futures_util::StreamExt;

        let chat_id = chatcmpl_id();
        let created = unix_now();

        let mut guard = MeterGuard::new(meter, status_code);
        let mut buffer = String::new();
        let mut body = std::pin::pin!(body);
        let mut keep_alive = interval(KEEP_ALIVE_INTERVAL);
        keep_alive.reset(); // Don't fire immediately

        loop {
            tokio::select! {
                biased; // Prefer data over keep-alive when both ready

                chunk_opt = body.next() => {
                    let Some(chunk_result) = chunk_opt else {
                        break; // Stream ended
                    };

                    let chunk = match chunk_result {
                        Ok(c) => c,
                        Err(e) => {
                            yield Err(std::io::Error::other(e));
                            break;
                        }
                    };

                    guard.push(&chunk);

                    let Ok(text) = std::str::from_utf8(&chunk) else {
                        continue;
                    };
                    buffer.push_str(text);

                    while let Some(newline_pos) = buffer.find('\n') {
                        let line = buffer[..newline_pos].trim().to_string();
                        buffer = buffer[newline_pos + 1..].to_string();

                        let Some(data) = line.strip_prefix("data:") else {
                            continue;
                        };
                        let data = data.trim();
                        if data == "[DONE]" {
                            continue;
                        }

                        let Ok(event) = serde_json::from_str::<Value>(data) else {
                            continue;
                        };
                        for frame in translate_event(&event, &chat_id, created, &model) {
                            yield Ok(Bytes::from(frame));
                        }
                    }
                }

                _ = keep_alive.tick() => {
                    yield Ok(Bytes::from(KEEP_ALIVE_COMMENT));
                }
            }
        }

        yield Ok(Bytes::from("data: [DONE]\n\n"));
        guard.finish().await;
    }
}
