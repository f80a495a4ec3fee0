//! Shared upstream dispatch for both front-ends.
//!
//! Both the transparent Anthropic route and the OpenAI translator run the
//! same path here: rewrite the path and headers, send the buffered request
//! body upstream, and hand the `reqwest::Response` back so each route owns
//! its own client-side response construction. Metering rides the response
//! stream via [`RequestMeter`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use chrono::Utc;
use rand::Rng;
use tracing::{info, warn};

use crate::AppState;
use crate::config::{Config, Upstream};
use crate::constants::ANTHROPIC_PREFIX;
use crate::error::ProxyError;
use crate::pricing::{self, Cost};
use crate::usage::UsageRecord;
use crate::usage::extract::extract_usage;

/// 8 random bytes, lowercase hex.
pub fn request_id() -> String {
    let bytes: [u8; 8] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Per-request identity and metadata carried through to the usage record.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub tenant_id: String,
    pub model: String,
    pub upstream_id: String,
    pub user_agent: String,
    pub client_ip: String,
    pub started: Instant,
}

/// Assembles and appends the usage record once the upstream response ends.
///
/// Extraction failure records zeros; store failures are logged and swallowed,
/// never surfaced to the client.
pub struct RequestMeter {
    pub state: Arc<AppState>,
    pub config: Arc<Config>,
    pub ctx: RequestContext,
}

impl RequestMeter {
    pub async fn complete(&self, status_code: u16, body: &[u8]) {
        let usage = extract_usage(body).unwrap_or_default();
        let cost = if self.ctx.model.is_empty() {
            Cost::default()
        } else {
            pricing::cost_for(&self.config.pricing, &self.ctx.model, &usage)
        };
        let duration = self.ctx.started.elapsed().as_millis() as u64;

        let record = UsageRecord {
            request_id: self.ctx.request_id.clone(),
            tenant_id: self.ctx.tenant_id.clone(),
            timestamp: Utc::now().to_rfc3339(),
            model: self.ctx.model.clone(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_creation_tokens: usage.cache_creation_tokens,
            cache_read_tokens: usage.cache_read_tokens,
            total_tokens: usage.total(),
            input_cost: cost.input,
            output_cost: cost.output,
            cache_creation_cost: cost.cache_creation,
            cache_read_cost: cost.cache_read,
            total_cost: cost.total,
            duration,
            status_code,
            upstream_id: self.ctx.upstream_id.clone(),
            user_agent: self.ctx.user_agent.clone(),
            client_ip: self.ctx.client_ip.clone(),
        };

        if let Err(e) = self.state.usage.record(&record).await {
            warn!(
                request_id = %self.ctx.request_id,
                tenant = %self.ctx.tenant_id,
                "failed to append usage record: {e}"
            );
        }

        info!(
            request_id = %self.ctx.request_id,
            tenant = %self.ctx.tenant_id,
            model = %self.ctx.model,
            upstream = %self.ctx.upstream_id,
            status = status_code,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            cost = cost.total,
            duration_ms = duration,
            "request completed"
        );
    }
}

/// Drop-safe wrapper around the metering tee buffer.
///
/// The forwarding stream pushes every upstream chunk here and calls
/// [`finish`](MeterGuard::finish) after the last byte is yielded, keeping the
/// record append strictly after the final body write. If the client
/// disconnects the stream is dropped mid-flight; the guard then completes the
/// record on a spawned task with whatever was observed.
pub struct MeterGuard {
    inner: Option<(RequestMeter, u16, Vec<u8>)>,
}

impl MeterGuard {
    pub fn new(meter: RequestMeter, status_code: u16) -> Self {
        Self {
            inner: Some((meter, status_code, Vec::new())),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if let Some((_, _, buffer)) = &mut self.inner {
            buffer.extend_from_slice(chunk);
        }
    }

    pub async fn finish(mut self) {
        if let Some((meter, status, buffer)) = self.inner.take() {
            meter.complete(status, &buffer).await;
        }
    }
}

impl Drop for MeterGuard {
    fn drop(&mut self) {
        if let Some((meter, status, buffer)) = self.inner.take()
            && let Ok(handle) = tokio::runtime::Handle::try_current()
        {
            handle.spawn(async move {
                meter.complete(status, &buffer).await;
            });
        }
    }
}

/// Rewrite the incoming path for an upstream.
///
/// `/anthropic/...` has the prefix stripped and the upstream URL's own path
/// (or `/`) prepended; anything else passes through unchanged.
pub fn rewrite_path(upstream_url: &url::Url, incoming_path: &str) -> String {
    match strip_anthropic_prefix(incoming_path) {
        Some(rest) => {
            let base = upstream_url.path().trim_end_matches('/');
            let rest = if rest.is_empty() { "/" } else { rest };
            format!("{base}{rest}")
        }
        None => incoming_path.to_string(),
    }
}

fn strip_anthropic_prefix(path: &str) -> Option<&str> {
    let rest = path.strip_prefix(ANTHROPIC_PREFIX)?;
    // "/anthropicfoo" is not a prefix hit
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

/// Headers never forwarded upstream: hop-by-hop plus everything the proxy
/// rewrites itself.
fn is_dropped_header(name: &str) -> bool {
    matches!(
        name,
        "host"
            | "authorization"
            | "x-api-key"
            | "content-length"
            | "connection"
            | "proxy-connection"
            | "keep-alive"
            | "transfer-encoding"
            | "te"
            | "trailer"
            | "upgrade"
    )
}

fn build_upstream_headers(headers: &HeaderMap, upstream: &Upstream) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::new();
    for (name, value) in headers {
        if is_dropped_header(name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.append(name, value);
        }
    }

    if let Some(key) = &upstream.key
        && let Ok(value) = reqwest::header::HeaderValue::from_str(&format!("Bearer {key}"))
    {
        out.insert(reqwest::header::AUTHORIZATION, value);
    }

    out
}

/// Send the buffered request to the chosen upstream.
///
/// The Host header comes from the upstream URL, the client's credential is
/// replaced with the upstream key, and the whole exchange is bounded by
/// `server.proxy.timeout`.
pub async fn dispatch(
    state: &AppState,
    config: &Config,
    upstream: &Upstream,
    method: &Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<reqwest::Response, ProxyError> {
    let base = url::Url::parse(&upstream.url)
        .map_err(|e| ProxyError::Internal(format!("upstream {} url: {e}", upstream.id)))?;

    let mut target = base.clone();
    target.set_path(&rewrite_path(&base, path));
    target.set_query(query);

    let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|e| ProxyError::Internal(format!("method: {e}")))?;

    state
        .http_client
        .request(method, target)
        .headers(build_upstream_headers(headers, upstream))
        .timeout(Duration::from_millis(config.proxy.timeout))
        .body(body)
        .send()
        .await
        .map_err(|e| ProxyError::UpstreamError(e.to_string()))
}
