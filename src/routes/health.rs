use std::sync::Arc;

use axum::{extract::State, response::Json};
use chrono::Utc;
use serde_json::{Value, json};

use crate::{AppState, BUILD_TIME, GIT_HASH, VERSION};

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "uptime": state.started_at.elapsed().as_secs(),
    }))
}

pub async fn version() -> Json<Value> {
    Json(json!({
        "version": VERSION,
        "gitHash": GIT_HASH,
        "buildTime": BUILD_TIME,
    }))
}
