//! Transparent reverse proxy for the Anthropic Messages API.
//!
//! This is the router's fallback handler: `/anthropic/**` gets its prefix
//! stripped, everything else is forwarded as-is. The upstream response is
//! streamed back bit-for-bit while a tee buffer collects it for metering.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::AppState;
use crate::auth;
use crate::constants::MAX_REQUEST_BODY_BYTES;
use crate::limits;
use crate::proxy::{self, RequestContext, RequestMeter};
use crate::transforms::passthrough_with_meter;
use crate::usage::extract::TokenUsage;

/// Response headers owned by the server side of the connection, never copied
/// from the upstream.
fn is_skipped_response_header(name: &str) -> bool {
    matches!(
        name,
        "content-length" | "transfer-encoding" | "connection" | "keep-alive" | "trailer"
    )
}

/// Client IP for the usage record: first X-Forwarded-For hop, else the peer.
pub fn client_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| addr.ip().to_string())
}

pub fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Plain 200 for bare OPTIONS requests (preflights carry an Origin and are
/// answered by the CORS layer).
fn options_ok() -> Response {
    (
        StatusCode::OK,
        [
            ("access-control-allow-origin", "*"),
            ("access-control-allow-methods", "GET, POST, PUT, DELETE, OPTIONS"),
            ("access-control-allow-headers", "*"),
        ],
    )
        .into_response()
}

pub async fn proxy(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    if request.method() == Method::OPTIONS {
        return options_ok();
    }

    let request_id = proxy::request_id();
    let started = Instant::now();
    let config = state.config.snapshot().await;

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_REQUEST_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return crate::error::ProxyError::InvalidRequest(format!(
                "failed to read request body: {e}"
            ))
            .to_proxy_response(&request_id);
        }
    };

    let query = parts.uri.query();
    let tenant = match auth::authenticate(&config, &parts.headers, query) {
        Ok(tenant) => tenant.clone(),
        Err(e) => {
            warn!(%request_id, path = %parts.uri.path(), "authentication failed: {e}");
            return e.to_proxy_response(&request_id);
        }
    };

    let model = auth::extract_model(&body);
    if let Some(model) = &model {
        if let Err(e) = auth::check_model_allowed(&tenant, model) {
            warn!(%request_id, tenant = %tenant.id, %model, "model rejected: {e}");
            return e.to_proxy_response(&request_id);
        }
        if let Err(e) = limits::check_daily_limit(
            &state.usage,
            &config.pricing,
            &tenant,
            model,
            &TokenUsage::default(),
        )
        .await
        {
            warn!(%request_id, tenant = %tenant.id, "daily limit reached: {e}");
            return e.to_proxy_response(&request_id);
        }
    }

    let upstream = match state.balancer.select().await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(%request_id, "upstream selection failed: {e}");
            return e.to_proxy_response(&request_id);
        }
    };

    // No byte has reached the client yet: dispatch failures become a clean
    // 502 JSON body.
    let upstream_response = match proxy::dispatch(
        &state,
        &config,
        &upstream,
        &parts.method,
        parts.uri.path(),
        query,
        &parts.headers,
        body,
    )
    .await
    {
        Ok(response) => response,
        Err(e) => {
            warn!(%request_id, upstream = %upstream.id, "dispatch failed: {e}");
            return e.to_proxy_response(&request_id);
        }
    };

    let status = upstream_response.status().as_u16();
    let meter = RequestMeter {
        state: state.clone(),
        config: config.clone(),
        ctx: RequestContext {
            request_id: request_id.clone(),
            tenant_id: tenant.id.clone(),
            model: model.unwrap_or_default(),
            upstream_id: upstream.id.clone(),
            user_agent: user_agent(&parts.headers),
            client_ip: client_ip(&parts.headers, &addr),
            started,
        },
    };

    let mut builder =
        Response::builder().status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));
    for (name, value) in upstream_response.headers() {
        if is_skipped_response_header(name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
            axum::http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            builder = builder.header(name, value);
        }
    }

    let stream = passthrough_with_meter(upstream_response.bytes_stream(), meter, status);
    match builder.body(Body::from_stream(stream)) {
        Ok(response) => response,
        Err(e) => {
            warn!(%request_id, "response assembly failed: {e}");
            crate::error::ProxyError::Internal(e.to_string()).to_proxy_response(&request_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn forwarded_ip_beats_peer_address() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(client_ip(&headers, &addr), "203.0.113.9");

        let headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, &addr), "127.0.0.1");
    }

    #[test]
    fn hop_headers_are_not_copied_back() {
        assert!(is_skipped_response_header("transfer-encoding"));
        assert!(is_skipped_response_header("content-length"));
        assert!(!is_skipped_response_header("content-type"));
        assert!(!is_skipped_response_header("anthropic-ratelimit-requests-remaining"));
    }
}
