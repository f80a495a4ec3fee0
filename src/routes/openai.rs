//! OpenAI Chat Completions front-end.
//!
//! Wraps the same authenticate → limit → select → dispatch pipeline as the
//! transparent route, but owns the response: requests are translated to the
//! Anthropic format before dispatch and responses are translated back,
//! streaming or not. Usage is metered from the raw Anthropic bytes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde_json::{Value, json};
use tracing::warn;

use crate::AppState;
use crate::auth;
use crate::constants::MESSAGES_PATH;
use crate::error::ProxyError;
use crate::limits;
use crate::proxy::{self, RequestContext, RequestMeter};
use crate::transforms::{
    AnthropicResponse, OpenAiChatRequest, anthropic_to_openai_stream, scrub_browser_headers,
    transform_openai_request, transform_openai_response,
};
use crate::usage::extract::TokenUsage;

use super::anthropic::{client_ip, user_agent};

/// Map an upstream error body (Anthropic error JSON or raw text) into the
/// OpenAI error shape, keeping the upstream status.
fn upstream_error_response(status: u16, body: &[u8]) -> Response {
    let (error_type, message) = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|doc| {
            let error = doc.get("error")?;
            Some((
                error.get("type")?.as_str()?.to_string(),
                error.get("message")?.as_str()?.to_string(),
            ))
        })
        .unwrap_or_else(|| {
            (
                "upstream_error".to_string(),
                String::from_utf8_lossy(body).into_owned(),
            )
        });

    (
        StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
        Json(json!({
            "error": {
                "message": message,
                "type": error_type,
                "code": status,
            }
        })),
    )
        .into_response()
}

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = proxy::request_id();
    let started = Instant::now();
    let config = state.config.snapshot().await;

    if !config.openai.enabled {
        return ProxyError::ServiceUnavailable(
            "OpenAI compatibility layer is disabled".to_string(),
        )
        .to_openai_response();
    }

    let tenant = match auth::authenticate(&config, &headers, uri.query()) {
        Ok(tenant) => tenant.clone(),
        Err(e) => {
            warn!(%request_id, "authentication failed: {e}");
            return e.to_openai_response();
        }
    };

    let openai_request: OpenAiChatRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return ProxyError::InvalidRequest(format!("bad JSON: {e}")).to_openai_response();
        }
    };

    let stream = openai_request.stream.unwrap_or(false);
    let anthropic_body = transform_openai_request(openai_request, &config.openai);
    let model = anthropic_body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    if let Err(e) = auth::check_model_allowed(&tenant, &model) {
        warn!(%request_id, tenant = %tenant.id, %model, "model rejected: {e}");
        return e.to_openai_response();
    }
    if let Err(e) = limits::check_daily_limit(
        &state.usage,
        &config.pricing,
        &tenant,
        &model,
        &TokenUsage::default(),
    )
    .await
    {
        warn!(%request_id, tenant = %tenant.id, "daily limit reached: {e}");
        return e.to_openai_response();
    }

    let upstream = match state.balancer.select().await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(%request_id, "upstream selection failed: {e}");
            return e.to_openai_response();
        }
    };

    let mut forward_headers = scrub_browser_headers(&headers);
    forward_headers.insert(
        header::CONTENT_TYPE,
        axum::http::HeaderValue::from_static("application/json"),
    );

    let payload = match serde_json::to_vec(&anthropic_body) {
        Ok(payload) => payload,
        Err(e) => return ProxyError::Internal(e.to_string()).to_openai_response(),
    };

    let upstream_response = match proxy::dispatch(
        &state,
        &config,
        &upstream,
        &Method::POST,
        MESSAGES_PATH,
        None,
        &forward_headers,
        Bytes::from(payload),
    )
    .await
    {
        Ok(response) => response,
        Err(e) => {
            warn!(%request_id, upstream = %upstream.id, "dispatch failed: {e}");
            return e.to_openai_response();
        }
    };

    let status = upstream_response.status().as_u16();
    let meter = RequestMeter {
        state: state.clone(),
        config: config.clone(),
        ctx: RequestContext {
            request_id: request_id.clone(),
            tenant_id: tenant.id.clone(),
            model: model.clone(),
            upstream_id: upstream.id.clone(),
            user_agent: user_agent(&headers),
            client_ip: client_ip(&headers, &addr),
            started,
        },
    };

    if !(200..300).contains(&status) {
        let bytes = upstream_response.bytes().await.unwrap_or_default();
        meter.complete(status, &bytes).await;
        return upstream_error_response(status, &bytes);
    }

    if stream {
        let sse = anthropic_to_openai_stream(
            upstream_response.bytes_stream(),
            model,
            meter,
            status,
        );
        match Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::CONNECTION, "keep-alive")
            .body(Body::from_stream(sse))
        {
            Ok(response) => response,
            Err(e) => ProxyError::Internal(e.to_string()).to_openai_response(),
        }
    } else {
        let bytes = match upstream_response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(%request_id, "failed to read upstream body: {e}");
                return ProxyError::UpstreamError(e.to_string()).to_openai_response();
            }
        };
        meter.complete(status, &bytes).await;

        let anthropic_response: AnthropicResponse = match serde_json::from_slice(&bytes) {
            Ok(response) => response,
            Err(e) => {
                warn!(%request_id, "failed to parse upstream response: {e}");
                return ProxyError::UpstreamError(format!("unparseable upstream response: {e}"))
                    .to_openai_response();
            }
        };
        Json(transform_openai_response(anthropic_response)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_errors_keep_status_and_type() {
        let body = br#"{"type":"error","error":{"type":"overloaded_error","message":"busy"}}"#;
        let response = upstream_error_response(529, body);
        assert_eq!(response.status().as_u16(), 529);
    }

    #[test]
    fn raw_text_errors_fall_back_to_upstream_error() {
        let response = upstream_error_response(500, b"internal blowup");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
