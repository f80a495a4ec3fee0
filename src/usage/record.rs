//! Usage record and aggregation shapes.

use std::collections::BTreeMap;

use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::pricing::round6;

/// One immutable line in a daily usage file: a single request's tokens, cost,
/// and metadata. Written exactly once, when the upstream response ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UsageRecord {
    pub request_id: String,
    pub tenant_id: String,
    /// ISO-8601 UTC
    pub timestamp: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub total_tokens: u64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub cache_creation_cost: f64,
    pub cache_read_cost: f64,
    pub total_cost: f64,
    /// Milliseconds from request start to last byte written
    pub duration: u64,
    pub status_code: u16,
    pub upstream_id: String,
    pub user_agent: String,
    #[serde(rename = "clientIP")]
    pub client_ip: String,
}

impl Default for UsageRecord {
    fn default() -> Self {
        Self {
            request_id: String::new(),
            tenant_id: String::new(),
            timestamp: String::new(),
            model: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            total_tokens: 0,
            input_cost: 0.0,
            output_cost: 0.0,
            cache_creation_cost: 0.0,
            cache_read_cost: 0.0,
            total_cost: 0.0,
            duration: 0,
            status_code: 0,
            upstream_id: String::new(),
            user_agent: String::new(),
            client_ip: String::new(),
        }
    }
}

/// Running counters shared by the top-level aggregation and its
/// per-model / per-hour buckets.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageTotals {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub errors: u64,
}

impl UsageTotals {
    fn add(&mut self, record: &UsageRecord) {
        self.requests += 1;
        self.input_tokens += record.input_tokens;
        self.output_tokens += record.output_tokens;
        self.cache_creation_tokens += record.cache_creation_tokens;
        self.cache_read_tokens += record.cache_read_tokens;
        self.total_tokens += record.total_tokens;
        self.total_cost = round6(self.total_cost + record.total_cost);
        if record.status_code >= 400 {
            self.errors += 1;
        }
    }
}

/// Aggregation over one or more daily files: the zero-aggregation counters
/// plus per-model and per-hour buckets of the same shape.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageAggregation {
    #[serde(flatten)]
    pub totals: UsageTotals,
    pub avg_tokens_per_request: f64,
    pub avg_cost_per_request: f64,
    /// Percent of records with status >= 400, integer-rounded
    pub error_rate: u32,
    pub by_model: BTreeMap<String, UsageTotals>,
    pub by_hour: BTreeMap<String, UsageTotals>,
}

impl UsageAggregation {
    pub fn add(&mut self, record: &UsageRecord) {
        self.totals.add(record);

        self.by_model
            .entry(record.model.clone())
            .or_default()
            .add(record);

        if let Ok(ts) = DateTime::parse_from_rfc3339(&record.timestamp) {
            use chrono::Timelike;
            let hour = format!("{:02}", ts.to_utc().hour());
            self.by_hour.entry(hour).or_default().add(record);
        }
    }

    /// Compute averages and error rate from the accumulated counters.
    pub fn finalize(mut self) -> Self {
        if self.totals.requests > 0 {
            let requests = self.totals.requests as f64;
            self.avg_tokens_per_request = self.totals.total_tokens as f64 / requests;
            self.avg_cost_per_request = round6(self.totals.total_cost / requests);
            self.error_rate = (self.totals.errors as f64 / requests * 100.0).round() as u32;
        }
        self
    }
}

/// Today's spend against the tenant's configured daily cap.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitStatus {
    pub tenant_id: String,
    pub date: String,
    pub spend: f64,
    /// Configured daily cap in USD; None means unlimited
    pub limit: Option<f64>,
    /// Integer percentage of the cap consumed (0 when unlimited)
    pub percentage: u32,
    pub exceeded: bool,
}
