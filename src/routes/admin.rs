//! Admin usage-query API.
//!
//! Mounted under the configured admin path and guarded by HTTP Basic Auth
//! against the configured credentials. Exposes the usage aggregations, the
//! balancer's health view, and config hot-reload. No tenant keys leave this
//! API.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::Engine;
use chrono::{Datelike, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/tenants", get(list_tenants))
        .route("/upstreams", get(list_upstreams))
        .route("/usage/{tenant}/daily", get(usage_daily))
        .route("/usage/{tenant}/weekly", get(usage_weekly))
        .route("/usage/{tenant}/monthly", get(usage_monthly))
        .route("/usage/{tenant}/range", get(usage_range))
        .route("/usage/{tenant}/limit", get(usage_limit))
        .route("/reload", post(reload))
        .layer(middleware::from_fn_with_state(state, auth_middleware))
}

/// Basic Auth check with constant-time credential comparison.
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let config = state.config.snapshot().await;
    let (username, password) = (&config.admin.username, &config.admin.password);

    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let Some(auth_value) = auth_header else {
        return unauthorized_response();
    };

    let Some(encoded) = auth_value.strip_prefix("Basic ") else {
        return unauthorized_response();
    };

    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return unauthorized_response();
    };

    let Ok(credentials) = String::from_utf8(decoded) else {
        return unauthorized_response();
    };

    let Some((provided_user, provided_pass)) = credentials.split_once(':') else {
        return unauthorized_response();
    };

    let user_match = provided_user.as_bytes().ct_eq(username.as_bytes());
    let pass_match = provided_pass.as_bytes().ct_eq(password.as_bytes());

    if user_match.into() && pass_match.into() {
        next.run(request).await
    } else {
        unauthorized_response()
    }
}

fn unauthorized_response() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"CCGate Admin\"")],
        "Unauthorized",
    )
        .into_response()
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message.into() })),
    )
        .into_response()
}

fn unknown_tenant(tenant_id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("unknown tenant: {tenant_id}") })),
    )
        .into_response()
}

async fn tenant_exists(state: &AppState, tenant_id: &str) -> bool {
    state
        .config
        .snapshot()
        .await
        .tenants
        .iter()
        .any(|t| t.id == tenant_id)
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::from_str(value).ok()
}

// --- Handlers ---

async fn list_tenants(State(state): State<Arc<AppState>>) -> Response {
    let config = state.config.snapshot().await;
    let tenants: Vec<_> = config
        .tenants
        .iter()
        .map(|t| {
            json!({
                "id": t.id,
                "name": t.name,
                "enabled": t.enabled,
                "allowedModels": t.allowed_models,
                "dailyMaxUSD": t.daily_max_usd(),
            })
        })
        .collect();
    Json(json!({ "tenants": tenants })).into_response()
}

async fn list_upstreams(State(state): State<Arc<AppState>>) -> Response {
    let config = state.config.snapshot().await;
    let health = state.balancer.health_snapshot().await;
    let upstreams: Vec<_> = config
        .upstreams
        .iter()
        .map(|u| {
            json!({
                "id": u.id,
                "name": u.name,
                "url": u.url,
                "weight": u.weight,
                "enabled": u.enabled,
                "health": health.get(&u.id).copied().unwrap_or(crate::balancer::Health::Unknown),
            })
        })
        .collect();
    Json(json!({ "upstreams": upstreams })).into_response()
}

#[derive(Deserialize)]
struct DailyQuery {
    date: Option<String>,
}

async fn usage_daily(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
    Query(query): Query<DailyQuery>,
) -> Response {
    if !tenant_exists(&state, &tenant_id).await {
        return unknown_tenant(&tenant_id);
    }
    let date = match &query.date {
        Some(raw) => match parse_date(raw) {
            Some(date) => date,
            None => return bad_request(format!("invalid date: {raw}")),
        },
        None => Utc::now().date_naive(),
    };
    Json(state.usage.daily_usage(&tenant_id, date).await).into_response()
}

#[derive(Deserialize)]
struct WeeklyQuery {
    start: Option<String>,
}

async fn usage_weekly(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
    Query(query): Query<WeeklyQuery>,
) -> Response {
    if !tenant_exists(&state, &tenant_id).await {
        return unknown_tenant(&tenant_id);
    }
    let start = match &query.start {
        Some(raw) => match parse_date(raw) {
            Some(date) => date,
            None => return bad_request(format!("invalid start date: {raw}")),
        },
        None => Utc::now().date_naive() - chrono::Days::new(6),
    };
    Json(state.usage.weekly_usage(&tenant_id, start).await).into_response()
}

#[derive(Deserialize)]
struct MonthlyQuery {
    year: Option<i32>,
    month: Option<u32>,
}

async fn usage_monthly(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
    Query(query): Query<MonthlyQuery>,
) -> Response {
    if !tenant_exists(&state, &tenant_id).await {
        return unknown_tenant(&tenant_id);
    }
    let today = Utc::now().date_naive();
    let year = query.year.unwrap_or_else(|| today.year());
    let month = query.month.unwrap_or_else(|| today.month());
    if !(1..=12).contains(&month) {
        return bad_request(format!("invalid month: {month}"));
    }
    Json(state.usage.monthly_usage(&tenant_id, year, month).await).into_response()
}

#[derive(Deserialize)]
struct RangeQuery {
    start: Option<String>,
    end: Option<String>,
}

async fn usage_range(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
    Query(query): Query<RangeQuery>,
) -> Response {
    if !tenant_exists(&state, &tenant_id).await {
        return unknown_tenant(&tenant_id);
    }
    let (Some(start_raw), Some(end_raw)) = (&query.start, &query.end) else {
        return bad_request("start and end are required");
    };
    let (Some(start), Some(end)) = (parse_date(start_raw), parse_date(end_raw)) else {
        return bad_request("start and end must be YYYY-MM-DD");
    };
    if end < start {
        return bad_request("end must not precede start");
    }
    Json(state.usage.range_usage(&tenant_id, start, end).await).into_response()
}

async fn usage_limit(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
) -> Response {
    let config = state.config.snapshot().await;
    let Some(tenant) = config.tenants.iter().find(|t| t.id == tenant_id) else {
        return unknown_tenant(&tenant_id);
    };
    Json(
        state
            .usage
            .limit_status(&tenant_id, tenant.daily_max_usd())
            .await,
    )
    .into_response()
}

/// Re-read the config directory and swap the snapshot. A failed validation
/// keeps the old snapshot and reports 400. On success the balancer gets the
/// new upstream list, WRR counters reset, and probes restart.
async fn reload(State(state): State<Arc<AppState>>) -> Response {
    match state.config.reload().await {
        Ok(fresh) => {
            state
                .balancer
                .clone()
                .reload(fresh.upstreams.clone(), &fresh.load_balancer)
                .await;
            info!(
                upstreams = fresh.upstreams.len(),
                tenants = fresh.tenants.len(),
                "configuration reloaded"
            );
            Json(json!({ "success": true })).into_response()
        }
        Err(e) => {
            warn!("configuration reload rejected: {e}");
            bad_request(e.to_string())
        }
    }
}
